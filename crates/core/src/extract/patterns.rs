//! Tier-2 extraction: scrape known line patterns out of a free-text
//! transcript when the agent failed to emit the fenced JSON block. Best
//! effort; a scrape that finds nothing falls through to reconstruction.

use std::sync::OnceLock;

use regex::Regex;

use crate::agent::AgentRole;
use crate::state::{DoubtOutcome, DoubtSeverity, EvidenceLevel, Grade};

use super::output::{
    BuildReport, ChallengeItem, ChallengeReport, ComponentVerdict, DecisionClaim, DoubtItem,
    DoubtReport, DoubtResolutionItem, GateReport, Hypothesis, PlanReport, ScoutReport,
    StructuredOutput, SummaryReport, VerifyReport,
};

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap_or_else(|e| panic!("bad pattern: {e}")))
}

// `GRADE[component]: sound` or `component: parser ... grade: sound`
fn grade_line() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(
        &CELL,
        r"(?im)^\s*(?:GRADE\[(?P<comp1>[^\]]+)\]|(?:component\s*[:=]\s*(?P<comp2>\S+).*?grade)|grade)\s*[:=]\s*(?P<grade>sound|good|weak|rejected)\b",
    )
}

fn decision_line() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(
        &CELL,
        r"(?im)^\s*DECISION\s*[:\-]\s*(?P<claim>.+?)(?:\s*\[evidence\s*[:=]\s*(?P<level>\w+)\])?\s*$",
    )
}

fn dead_approach_line() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"(?im)^\s*DEAD[ _\-]APPROACH\s*[:\-]\s*(?P<approach>.+)$")
}

fn doubt_line() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(
        &CELL,
        r"(?im)^\s*DOUBT\s*[:\-]\s*(?P<claim>.+?)(?:\s*\[severity\s*[:=]\s*(?P<severity>minor|moderate|critical)\])?\s*$",
    )
}

fn challenge_line() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(
        &CELL,
        r"(?im)^\s*CHALLENGE\s*[:\-]\s*(?P<claim>.+?)\s*=>\s*(?P<objection>.+)$",
    )
}

fn resolution_line() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(
        &CELL,
        r"(?im)^\s*RESOLVE(?:\[(?P<id>\d+)\])?\s*[:\-]\s*(?P<outcome>confirmed|dismissed|inconclusive)\b(?:\s*[:\-]\s*(?P<evidence>.+))?$",
    )
}

fn verdict_word() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(
        &CELL,
        r"(?im)^\s*(?:VERDICT|GATE)\s*[:\-]\s*(?P<verdict>approved|rejected)\b(?:\s*[:\-]\s*(?P<reason>.+))?$",
    )
}

fn hypothesis_line() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(
        &CELL,
        r"(?im)^\s*HYPOTHESIS\s*[:\-]\s*(?P<hypothesis>.+?)\s*\|\s*(?P<mechanism>.+?)(?:\s*\|\s*(?P<sub_type>\S+))?\s*$",
    )
}

fn guidance_block() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"(?is)GUIDANCE\s*[:\-]\s*(?P<guidance>.+)")
}

/// Scrape role-appropriate patterns from a transcript.
pub fn scrape(role: AgentRole, raw: &str) -> StructuredOutput {
    match role {
        AgentRole::Builder => {
            let decisions = decision_line()
                .captures_iter(raw)
                .map(|c| DecisionClaim {
                    claim: c["claim"].trim().to_string(),
                    evidence_level: c
                        .name("level")
                        .and_then(|m| EvidenceLevel::parse(&m.as_str().to_lowercase())),
                })
                .collect();
            let dead_approaches = dead_approach_line()
                .captures_iter(raw)
                .map(|c| c["approach"].trim().to_string())
                .collect();
            StructuredOutput::Build(BuildReport {
                summary: String::new(),
                decisions,
                dead_approaches,
            })
        }
        AgentRole::Challenger => {
            let challenges = challenge_line()
                .captures_iter(raw)
                .map(|c| ChallengeItem {
                    target_claim: c["claim"].trim().to_string(),
                    objection: c["objection"].trim().to_string(),
                })
                .collect();
            StructuredOutput::Challenge(ChallengeReport { challenges })
        }
        AgentRole::Doubter => {
            let doubts = doubt_line()
                .captures_iter(raw)
                .map(|c| DoubtItem {
                    claim: c["claim"].trim().to_string(),
                    evidence_level: None,
                    evidence: String::new(),
                    severity: c
                        .name("severity")
                        .and_then(|m| DoubtSeverity::parse(&m.as_str().to_lowercase())),
                })
                .collect();
            StructuredOutput::Doubt(DoubtReport { doubts })
        }
        AgentRole::Scout => {
            let doubt_resolutions = resolution_line()
                .captures_iter(raw)
                .map(|c| DoubtResolutionItem {
                    doubt_id: c.name("id").and_then(|m| m.as_str().parse().ok()),
                    outcome: DoubtOutcome::parse(&c["outcome"].to_lowercase()),
                    evidence: c
                        .name("evidence")
                        .map(|m| m.as_str().trim().to_string())
                        .unwrap_or_default(),
                })
                .collect();
            StructuredOutput::Scout(ScoutReport {
                findings: String::new(),
                doubt_resolutions,
            })
        }
        AgentRole::Verifier => {
            let components = grade_line()
                .captures_iter(raw)
                .map(|c| {
                    let component = c
                        .name("comp1")
                        .or_else(|| c.name("comp2"))
                        .map(|m| m.as_str().trim().to_string())
                        .unwrap_or_else(|| "overall".to_string());
                    ComponentVerdict {
                        component,
                        grade: Grade::parse(&c["grade"].to_lowercase()),
                        provenance_intact: None,
                        content_correct: None,
                        notes: String::new(),
                    }
                })
                .collect();
            StructuredOutput::Verify(VerifyReport { components })
        }
        AgentRole::Gatekeeper => {
            let report = verdict_word()
                .captures(raw)
                .map(|c| GateReport {
                    approved: c["verdict"].eq_ignore_ascii_case("approved"),
                    reason: c
                        .name("reason")
                        .map(|m| m.as_str().trim().to_string())
                        .unwrap_or_default(),
                    sub_type: None,
                    reframed_hypothesis: None,
                })
                .unwrap_or_default();
            StructuredOutput::Gate(report)
        }
        AgentRole::Planner => {
            let hypotheses = hypothesis_line()
                .captures_iter(raw)
                .map(|c| Hypothesis {
                    hypothesis: c["hypothesis"].trim().to_string(),
                    mechanism: c["mechanism"].trim().to_string(),
                    sub_type: c.name("sub_type").map(|m| m.as_str().to_string()),
                })
                .collect();
            StructuredOutput::Plan(PlanReport { hypotheses })
        }
        AgentRole::Summarizer => {
            let guidance = guidance_block()
                .captures(raw)
                .map(|c| c["guidance"].trim().to_string())
                .unwrap_or_default();
            let dead_approaches = dead_approach_line()
                .captures_iter(raw)
                .map(|c| c["approach"].trim().to_string())
                .collect();
            StructuredOutput::Summary(SummaryReport {
                guidance,
                dead_approaches,
            })
        }
    }
}
