//! # Transcript Extraction
//!
//! Agents are asked to end their transcript with a single fenced JSON block.
//! They frequently don't. Extraction runs three tiers in fixed order:
//!
//! 1. exact parse of the single fenced JSON block,
//! 2. pattern scrape of known line formats,
//! 3. reconstruction by a secondary agent handed the raw transcript and the
//!    role's JSON schema.
//!
//! When all three fail, the raw transcript is preserved on disk and the step
//! fails loudly. Nothing is ever silently defaulted at this layer.

mod output;
mod patterns;

pub use output::{
    BuildReport, ChallengeItem, ChallengeReport, ComponentVerdict, DecisionClaim, DoubtItem,
    DoubtReport, DoubtResolutionItem, GateReport, Hypothesis, PlanReport, ScoutReport,
    StructuredOutput, SummaryReport, VerifyReport,
};

use anyhow::Result;

use crate::agent::{AgentRequest, AgentRole};
use crate::context::CycleContext;
use crate::error::CoreError;
use crate::state::io;

/// How the structured output was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Exact,
    Patterns,
    Reconstructed,
}

impl Tier {
    /// Only an exact parse is trusted without reservation.
    pub fn confident(&self) -> bool {
        matches!(self, Self::Exact)
    }
}

/// Raw transcript cap for reconstruction prompts.
const RAW_CAP: usize = 16_000;

/// Extract structured output from a transcript, escalating through the tiers.
pub async fn extract(
    ctx: &CycleContext,
    slug: &str,
    role: AgentRole,
    raw: &str,
) -> Result<(StructuredOutput, Tier)> {
    // Tier 1: exactly one fenced JSON block.
    if let Some(block) = single_fenced_json(raw) {
        if let Ok(output) = StructuredOutput::parse_for_role(role, block) {
            return Ok((output, Tier::Exact));
        }
    }

    // Tier 2: pattern scrape; only a populated result counts.
    let scraped = patterns::scrape(role, raw);
    if scraped.is_populated() {
        tracing::debug!(%role, "extraction fell back to pattern scrape");
        return Ok((scraped, Tier::Patterns));
    }

    // Tier 3: secondary agent reconstructs against the role's schema.
    if let Some(output) = reconstruct(ctx, role, raw).await {
        tracing::info!(%role, "extraction fell back to agent reconstruction");
        return Ok((output, Tier::Reconstructed));
    }

    let path = io::preserve_raw(&ctx.project_root, slug, role.as_str(), raw)?;
    tracing::error!(%role, raw_path = %path.display(), "all extraction tiers failed");
    Err(CoreError::ExtractionFailure {
        role,
        raw_len: raw.len(),
    }
    .into())
}

/// The content of the fenced ```json block, but only when there is exactly
/// one. Multiple blocks are ambiguous and fail the tier rather than guessing.
fn single_fenced_json(raw: &str) -> Option<&str> {
    let mut blocks = Vec::new();
    let mut rest = raw;
    while let Some(start) = rest.find("```json") {
        let after = &rest[start + "```json".len()..];
        let Some(end) = after.find("```") else { break };
        blocks.push(after[..end].trim());
        rest = &after[end + 3..];
    }
    match blocks.as_slice() {
        [only] => Some(only),
        _ => None,
    }
}

async fn reconstruct(ctx: &CycleContext, role: AgentRole, raw: &str) -> Option<StructuredOutput> {
    let schema = StructuredOutput::schema_for_role(role);
    let schema_json = serde_json::to_string_pretty(&schema).ok()?;
    let capped: String = raw.chars().take(RAW_CAP).collect();

    let prompt = format!(
        "The transcript below was produced by a {role} agent that failed to \
         emit its structured output. Reconstruct that output as a single \
         fenced ```json block conforming exactly to this JSON schema. Use \
         only facts present in the transcript; leave fields empty rather \
         than inventing content.\n\nSchema:\n{schema_json}\n\nTranscript:\n{capped}"
    );

    let request = AgentRequest::new(
        AgentRole::Summarizer,
        prompt,
        ctx.config.model_for(AgentRole::Summarizer),
    )
    .in_dir(&ctx.project_root)
    .with_timeout(ctx.config.subprocess_timeout());

    let reply = match ctx.invoker.invoke(&request).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(%role, error = %e, "reconstruction agent failed");
            return None;
        }
    };

    let block = single_fenced_json(&reply.text).unwrap_or(reply.text.trim());
    let output = StructuredOutput::parse_for_role(role, block).ok()?;
    output.is_populated().then_some(output)
}
