//! Context derivation heuristics and the rerun / follow-up query builders.
//!
//! Everything here is best-effort string heuristics over free-form moderator
//! output. The extracted packets are advisory: fields may be absent and no
//! invariant may depend on their structure.

use crate::artifacts::{AggregateRank, ContextSummary, PanelResponse, TldrPacket};
use crate::config::ContextVerbosity;
use crate::prompts::{short_model_name, truncate_chars};

/// Lines captured after a matched section header.
const SECTION_MAX_LINES: usize = 5;
/// Verdict summary character cap.
const VERDICT_MAX_CHARS: usize = 800;
/// Dissent excerpt character cap.
const DISSENT_EXCERPT_CHARS: usize = 200;
/// Dissent excerpts kept.
const DISSENT_MAX_POINTS: usize = 3;

/// Capture up to five non-empty lines starting at the header line, stopping
/// at the first blank line after content begins.
fn extract_section(lines: &[&str], header_idx: usize) -> Option<String> {
    let mut content = Vec::new();
    for line in lines
        .iter()
        .skip(header_idx)
        .take(SECTION_MAX_LINES.min(lines.len() - header_idx))
    {
        let line = line.trim();
        if !line.is_empty() {
            content.push(line);
        } else if !content.is_empty() {
            break;
        }
    }
    if content.is_empty() {
        None
    } else {
        Some(content.join(" "))
    }
}

/// Scan a prior synthesis for TL;DR fields, keyed on common section headers.
///
/// If nothing fires, the first 500 characters become the recommendation.
pub fn extract_tldr_packet(stage3_response: &str) -> TldrPacket {
    let lines: Vec<&str> = stage3_response.split('\n').collect();
    let mut packet = TldrPacket::default();

    for (i, line) in lines.iter().enumerate() {
        let line_lower = line.to_lowercase();
        let line_lower = line_lower.trim();

        if line_lower.contains("recommendation") || line_lower.contains("verdict") {
            packet.recommendation = extract_section(&lines, i);
        } else if line_lower.contains("confidence") {
            packet.confidence = extract_section(&lines, i);
        } else if line_lower.contains("risk") {
            packet.key_risks = extract_section(&lines, i);
        } else if line_lower.contains("tradeoff") || line_lower.contains("trade-off") {
            packet.tradeoffs = extract_section(&lines, i);
        } else if line_lower.contains("flip") || line_lower.contains("reconsider") {
            packet.flip_condition = extract_section(&lines, i);
        } else if line_lower.contains("action") || line_lower.contains("next step") {
            packet.action_plan = extract_section(&lines, i);
        }
    }

    if packet.is_empty() {
        packet.recommendation = Some(truncate_chars(stage3_response, 500));
    }
    packet
}

/// Condense the moderator's response to a verdict summary of at most 800
/// characters. Prefers verdict-like sections, falls back to truncation.
pub fn extract_verdict_summary(stage3_response: &str) -> String {
    let lines: Vec<&str> = stage3_response.split('\n').collect();
    let mut verdict_lines: Vec<&str> = Vec::new();
    let mut in_verdict = false;

    for &line in &lines {
        let line_lower = line.to_lowercase();
        let line_lower = line_lower.trim();

        let is_header = ["verdict", "recommendation", "conclusion", "final answer", "summary"]
            .iter()
            .any(|kw| line_lower.contains(kw));

        if is_header {
            in_verdict = true;
            verdict_lines.push(line);
        } else if in_verdict {
            let trimmed = line.trim();
            let numbered = trimmed.chars().next().is_some_and(|c| c.is_ascii_digit())
                && trimmed.chars().take(3).any(|c| c == '.');
            if (line.starts_with('#') || numbered) && verdict_lines.len() > 2 {
                break;
            }
            verdict_lines.push(line);
        }
    }

    let joined = verdict_lines.join(" ");
    let joined = joined.trim();
    if joined.len() > 50 {
        return truncate_chars(joined, VERDICT_MAX_CHARS);
    }
    truncate_chars(stage3_response, VERDICT_MAX_CHARS)
}

/// Excerpts from the panelists the aggregate ranking placed last.
///
/// Takes the bottom two ranked panelists and quotes the opening of their
/// stage-1 responses, up to three excerpts total.
pub fn extract_dissenting_points(
    stage1: &[PanelResponse],
    aggregate: &[AggregateRank],
) -> Vec<String> {
    if aggregate.len() < 2 {
        return Vec::new();
    }
    let bottom: Vec<&str> = aggregate
        .iter()
        .rev()
        .take(2)
        .map(|r| r.model.as_str())
        .collect();

    let mut dissenting = Vec::new();
    for result in stage1 {
        if !bottom.contains(&result.model.as_str()) {
            continue;
        }
        let first_paragraph = result
            .response
            .split("\n\n")
            .map(str::trim)
            .find(|p| !p.is_empty());
        if let Some(paragraph) = first_paragraph {
            dissenting.push(format!(
                "{}: {}",
                short_model_name(&result.model),
                truncate_chars(paragraph, DISSENT_EXCERPT_CHARS)
            ));
        }
    }
    dissenting.truncate(DISSENT_MAX_POINTS);
    dissenting
}

/// Build the context packet saved alongside a committed answer.
pub fn build_context_summary(
    original_question: &str,
    stage1: &[PanelResponse],
    aggregate: &[AggregateRank],
    stage3_response: &str,
) -> ContextSummary {
    ContextSummary {
        original_question: original_question.to_string(),
        verdict_summary: extract_verdict_summary(stage3_response),
        key_dissenting_points: extract_dissenting_points(stage1, aggregate),
        aggregate_rankings: aggregate.to_vec(),
        stage1_models: stage1.iter().map(|r| r.model.clone()).collect(),
    }
}

/// Build the effective query for a rerun, prepending the prior run's context.
///
/// With `new_input` the panel is asked to update the verdict; without it, to
/// give an independent second opinion.
pub fn build_rerun_query(
    original_question: &str,
    packet: &TldrPacket,
    new_input: Option<&str>,
) -> String {
    let mut context_parts = vec![format!("Original Decision Question: {original_question}")];
    if let Some(v) = &packet.recommendation {
        context_parts.push(format!("Previous Recommendation: {v}"));
    }
    if let Some(v) = &packet.confidence {
        context_parts.push(format!("Previous Confidence: {v}"));
    }
    if let Some(v) = &packet.key_risks {
        context_parts.push(format!("Key Risks Identified: {v}"));
    }
    if let Some(v) = &packet.tradeoffs {
        context_parts.push(format!("Tradeoffs: {v}"));
    }
    if let Some(v) = &packet.flip_condition {
        context_parts.push(format!("Flip Condition: {v}"));
    }
    let context_summary = context_parts.join("\n");

    match new_input.map(str::trim).filter(|s| !s.is_empty()) {
        Some(input) => format!(
            "{context_summary}\n\n\
             NEW INFORMATION/FOLLOW-UP:\n{input}\n\n\
             INSTRUCTION: Update the verdict based on the new input above. Clearly state what changed since the last verdict and provide an updated recommendation."
        ),
        None => format!(
            "{context_summary}\n\n\
             INSTRUCTION: Provide an independent recommendation for this decision. Do NOT assume the previous verdict is correct. If you agree with the previous recommendation, explain why. If you disagree, explain what you would change and why."
        ),
    }
}

/// Build the effective query for a follow-up question.
///
/// Begins with the verbatim prior synthesis, adds verbosity-dependent context
/// from the saved summary, and ends with the new input under a respond-to-it
/// directive.
pub fn build_followup_query(
    prior_stage3: &str,
    summary: Option<&ContextSummary>,
    verbosity: ContextVerbosity,
    new_input: &str,
) -> String {
    let mut sections = vec![prior_stage3.to_string()];

    if let Some(summary) = summary {
        if matches!(verbosity, ContextVerbosity::Standard | ContextVerbosity::Full)
            && !summary.key_dissenting_points.is_empty()
        {
            let dissent = summary
                .key_dissenting_points
                .iter()
                .map(|p| format!("- {p}"))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("Key Dissenting Views:\n{dissent}"));
        }
        if matches!(verbosity, ContextVerbosity::Full) && !summary.aggregate_rankings.is_empty() {
            let rankings = summary
                .aggregate_rankings
                .iter()
                .map(|r| format!("{} (avg rank: {})", short_model_name(&r.model), r.average_rank))
                .collect::<Vec<_>>()
                .join(", ");
            sections.push(format!("Panel Rankings (best to worst): {rankings}"));
        }
    }

    sections.push(format!(
        "---\n\nNEW INPUT:\n{new_input}\n\n\
         Respond to the new input above, taking the answer before it into account."
    ));
    sections.join("\n\n")
}
