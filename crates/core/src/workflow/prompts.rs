//! Prompt construction for each workflow step. Prompts stay thin: context
//! the agent needs, the job, and the exact shape of the closing JSON block.

use crate::state::{DeadEnd, Decision, Doubt, Experiment};

fn constraints_section(constraints: &[DeadEnd]) -> String {
    if constraints.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = constraints
        .iter()
        .map(|d| format!("- {} (tried: {}; failed: {})", d.structural_constraint, d.approach, d.why_failed))
        .collect();
    format!(
        "\nKnown structural constraints for this problem category. Do not \
         repeat these approaches:\n{}\n",
        lines.join("\n")
    )
}

fn decisions_section(decisions: &[Decision]) -> String {
    if decisions.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = decisions
        .iter()
        .map(|d| format!("- [{}] {} ({})", d.id, d.claim, d.evidence_level.as_str()))
        .collect();
    format!("\nDecisions recorded so far:\n{}\n", lines.join("\n"))
}

pub fn classify(hypothesis: &str) -> String {
    format!(
        "Classify this experiment hypothesis. Assign a short snake_case \
         sub_type naming the problem category, and reframe the hypothesis \
         if it is vague or unfalsifiable as stated. End with a single fenced \
         ```json block: {{\"approved\": true, \"reason\": \"\", \
         \"sub_type\": \"...\", \"reframed_hypothesis\": null}}\n\n\
         Hypothesis: {hypothesis}"
    )
}

pub fn gate(experiment: &Experiment, constraints: &[DeadEnd]) -> String {
    let prior_rejection = experiment
        .gate_rejection_reason
        .as_deref()
        .map(|r| format!("\nA previous gate attempt rejected this hypothesis: {r}\n"))
        .unwrap_or_default();
    format!(
        "Decide whether this experiment is worth building: falsifiable, \
         plausibly valuable, and not already blocked by a known constraint.\
         {}{prior_rejection}\nEnd with a single fenced ```json block: \
         {{\"approved\": true|false, \"reason\": \"...\"}}\n\n\
         Hypothesis: {}\nCategory: {}",
        constraints_section(constraints),
        experiment.hypothesis,
        experiment.sub_type
    )
}

pub fn build(experiment: &Experiment, constraints: &[DeadEnd]) -> String {
    let guidance = if experiment.builder_guidance.is_empty() {
        String::new()
    } else {
        format!(
            "\nGuidance from previous iterations (latest section is most \
             relevant):\n{}\n",
            experiment.builder_guidance
        )
    };
    format!(
        "Implement this experiment in the working tree. Record every \
         significant decision with its evidence level, and name any approach \
         you discovered to be dead.{}{guidance}\nEnd with a single fenced \
         ```json block: {{\"summary\": \"...\", \"decisions\": \
         [{{\"claim\": \"...\", \"evidence_level\": \"test\"}}], \
         \"dead_approaches\": [\"...\"]}}\n\n\
         Hypothesis: {}\nCategory: {}",
        constraints_section(constraints),
        experiment.hypothesis,
        experiment.sub_type
    )
}

pub fn challenge(experiment: &Experiment, decisions: &[Decision]) -> String {
    format!(
        "Attack the claims below. For each claim you can credibly object to, \
         state the claim and the objection.{}\nEnd with a single fenced \
         ```json block: {{\"challenges\": [{{\"target_claim\": \"...\", \
         \"objection\": \"...\"}}]}}\n\nHypothesis: {}",
        decisions_section(decisions),
        experiment.hypothesis
    )
}

pub fn doubt(experiment: &Experiment, decisions: &[Decision]) -> String {
    format!(
        "List what remains unproven about this implementation. Each doubt \
         names the claim in question, the evidence level it currently rests \
         on, and a severity.{}\nEnd with a single fenced ```json block: \
         {{\"doubts\": [{{\"claim\": \"...\", \"evidence_level\": \
         \"judgment\", \"evidence\": \"\", \"severity\": \"moderate\"}}]}}\n\n\
         Hypothesis: {}",
        decisions_section(decisions),
        experiment.hypothesis
    )
}

pub fn scout(experiment: &Experiment, doubts: &[Doubt]) -> String {
    let lines: Vec<String> = doubts
        .iter()
        .map(|d| format!("- id {}: {} [{}]", d.id, d.claim, d.severity.as_str()))
        .collect();
    format!(
        "Investigate the open doubts below by reading code and running \
         commands. Resolve each one, citing its id and keeping the order \
         given. End with a single fenced ```json block: \
         {{\"findings\": \"...\", \"doubt_resolutions\": [{{\"doubt_id\": N, \
         \"outcome\": \"confirmed|dismissed|inconclusive\", \
         \"evidence\": \"...\"}}]}}\n\nHypothesis: {}\n\nOpen doubts:\n{}",
        experiment.hypothesis,
        lines.join("\n")
    )
}

pub fn verify(experiment: &Experiment, confirmed_doubts: &[Doubt]) -> String {
    let doubt_lines = if confirmed_doubts.is_empty() {
        String::new()
    } else {
        let lines: Vec<String> = confirmed_doubts
            .iter()
            .map(|d| format!("- {}", d.claim))
            .collect();
        format!("\nConfirmed doubts to weigh:\n{}\n", lines.join("\n"))
    };
    format!(
        "Verify this implementation component by component. For each, check \
         provenance (the change does what its decisions claim) and content \
         (the behavior is correct), then grade it sound, good, weak, or \
         rejected.{doubt_lines}\nEnd with a single fenced ```json block: \
         {{\"components\": [{{\"component\": \"...\", \"grade\": \"sound\", \
         \"provenance_intact\": true, \"content_correct\": true, \
         \"notes\": \"\"}}]}}\n\nHypothesis: {}",
        experiment.hypothesis
    )
}

pub fn compress(guidance: &str) -> String {
    format!(
        "Compress the accumulated guidance below into one concise document \
         that preserves every still-relevant instruction and drops repetition. \
         End with a single fenced ```json block: {{\"guidance\": \"...\", \
         \"dead_approaches\": []}}\n\nGuidance:\n{guidance}"
    )
}

pub fn plan(goal: &str, parallel: usize, constraints: &[DeadEnd]) -> String {
    format!(
        "Propose up to {parallel} independent experiment hypotheses toward \
         the goal below. Each must name a distinct causal mechanism; two \
         hypotheses sharing a mechanism are duplicates.{}\nEnd with a single \
         fenced ```json block: {{\"hypotheses\": [{{\"hypothesis\": \"...\", \
         \"mechanism\": \"...\", \"sub_type\": \"...\"}}]}}\n\nGoal: {goal}",
        constraints_section(constraints)
    )
}
