//! Prompt templates for the pipeline stages.
//!
//! Three of these are contract-level: the ranking prompt (its `FINAL RANKING:`
//! section feeds the stage-2 parser), the synthesis prompt (must forbid
//! anonymous labels in the output), and the strict anti-echo retry prompt.
//! Changing their structural tokens breaks downstream parsing.

use crate::artifacts::{PanelResponse, RankingBallot};
use crate::ranking::response_label;

/// Truncate to `max` characters on a char boundary, appending `...` if cut.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}...", &s[..i]),
        None => s.to_string(),
    }
}

/// Short display name for an endpoint identifier (the part after the last `/`).
pub(crate) fn short_model_name(model: &str) -> &str {
    model.rsplit('/').next().unwrap_or(model)
}

/// Stage-2 ranking prompt. Presents the responses anonymized as
/// `Response A..` and demands a literally formatted `FINAL RANKING:` section.
pub fn ranking_prompt(question: &str, responses: &[PanelResponse]) -> String {
    let responses_text = responses
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}:\n{}", response_label(i), r.response))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are evaluating different responses to the following question:\n\n\
         Question: {question}\n\n\
         Here are the responses from different models (anonymized):\n\n\
         {responses_text}\n\n\
         Your task:\n\
         1. First, evaluate each response individually. For each response, explain what it does well and what it does poorly.\n\
         2. Then, at the very end of your response, provide a final ranking.\n\n\
         IMPORTANT: Your final ranking MUST be formatted EXACTLY as follows:\n\
         - Start with the line \"FINAL RANKING:\" (all caps, with colon)\n\
         - Then list the responses from best to worst as a numbered list\n\
         - Each line should be: number, period, space, then ONLY the response label (e.g., \"1. Response A\")\n\
         - Do not add any other text or explanations in the ranking section\n\n\
         Example of the correct format for your ENTIRE response:\n\n\
         Response A provides good detail on X but misses Y...\n\
         Response B is accurate but lacks depth on Z...\n\
         Response C offers the most comprehensive answer...\n\n\
         FINAL RANKING:\n\
         1. Response C\n\
         2. Response A\n\
         3. Response B\n\n\
         Now provide your evaluation and ranking:"
    )
}

/// Stage-3 synthesis prompt. Stage-1 (or refined) responses are keyed by
/// endpoint identifier and the stage-2 rankings are included verbatim; the
/// moderator must not reference the anonymous labels.
pub fn synthesis_prompt(
    question: &str,
    responses: &[PanelResponse],
    ballots: &[RankingBallot],
) -> String {
    let stage1_text = responses
        .iter()
        .map(|r| format!("Panelist: {}\nResponse: {}", r.model, r.response))
        .collect::<Vec<_>>()
        .join("\n\n");

    if ballots.is_empty() {
        return format!(
            "You are the Moderator of an expert panel. Multiple AI models have provided responses to a user's question.\n\n\
             Original Question: {question}\n\n\
             Individual Responses:\n{stage1_text}\n\n\
             Your task as Moderator is to synthesize all of these responses into a single, comprehensive, accurate answer to the user's original question.\n\n\
             IMPORTANT: Do NOT reference individual models or responses by name. Directly synthesize the best insights into a unified answer.\n\n\
             Consider:\n\
             - The key insights from each response\n\
             - Areas of agreement and disagreement\n\
             - The strongest arguments and evidence presented\n\n\
             Provide a clear, well-reasoned final answer that represents the panel's collective judgment:"
        );
    }

    let stage2_text = ballots
        .iter()
        .map(|b| format!("Panelist: {}\nRanking: {}", b.model, b.ranking))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are the Moderator of an expert panel. Multiple AI models have provided responses to a user's question, and then ranked each other's responses.\n\n\
         Original Question: {question}\n\n\
         STAGE 1 - Individual Responses:\n{stage1_text}\n\n\
         STAGE 2 - Peer Rankings:\n{stage2_text}\n\n\
         Your task as Moderator is to synthesize all of this information into a single, comprehensive, accurate answer to the user's original question.\n\n\
         IMPORTANT: Do NOT reference \"Response A\", \"Response B\", etc. in your synthesis. The anonymous labels are internal to the peer review process. Instead, directly synthesize the best insights into a unified answer.\n\n\
         Consider:\n\
         - The individual responses and their insights\n\
         - The peer rankings and what they reveal about response quality\n\
         - Any patterns of agreement or disagreement\n\n\
         Provide a clear, well-reasoned final answer that represents the panel's collective judgment:"
    )
}

/// Stage-1.5 cross-review prompt for one panelist. Its own prior response is
/// shown verbatim; `others` must already be shuffled by the caller and are
/// relabeled `Response A..` in the shuffled order.
pub fn cross_review_prompt(
    question: &str,
    own_response: &str,
    others: &[&PanelResponse],
) -> String {
    let others_text = others
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}:\n{}", response_label(i), r.response))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are participating in a cross-review step of a panel deliberation.\n\n\
         ORIGINAL QUESTION:\n{question}\n\n\
         YOUR ORIGINAL RESPONSE:\n{own_response}\n\n\
         OTHER PANELIST RESPONSES (anonymized):\n{others_text}\n\n\
         ---\n\n\
         YOUR TASK:\n\
         The response labeled \"YOUR ORIGINAL RESPONSE\" above is yours from the first round.\n\
         The other responses (A, B, C, etc.) are from anonymous fellow panelists.\n\n\
         Provide your REFINED answer considering all perspectives. You may:\n\
         - Incorporate valuable insights from other responses you hadn't considered\n\
         - Strengthen your argument if you believe your initial position was correct\n\
         - Change or nuance your position if another response convinced you\n\
         - Address points of disagreement directly\n\
         - Correct any errors you notice\n\n\
         Important: This is your FINAL answer before the peer ranking phase. Make it comprehensive and well-reasoned.\n\n\
         Your refined response:"
    )
}

/// Strict retry prompt issued after a confirmed moderator echo. Summarizes
/// the top panel responses and forbids repeating the question.
pub fn strict_synthesis_retry_prompt(question: &str, responses: &[PanelResponse]) -> String {
    let summary = responses
        .iter()
        .take(4)
        .map(|r| {
            format!(
                "- {}: {}",
                short_model_name(&r.model),
                truncate_chars(&r.response, 800)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let query_context = truncate_chars(question, 1500);

    format!(
        "CRITICAL: Do NOT repeat the question. Provide ONLY your synthesis/recommendation.\n\n\
         QUESTION CONTEXT (reference only - DO NOT INCLUDE IN YOUR RESPONSE):\n{query_context}\n\n\
         PANELIST RESPONSES:\n{summary}\n\n\
         INSTRUCTIONS:\n\
         - Start DIRECTLY with your synthesis or recommendation\n\
         - Do NOT echo, quote, or summarize the question\n\
         - Synthesize the panelist responses into actionable guidance\n\
         - Use structured formatting (headers, bullets) for clarity\n\n\
         YOUR SYNTHESIS:"
    )
}

/// Prompt for the detached title-generation subtask.
pub fn title_prompt(question: &str) -> String {
    format!(
        "Generate a very short title (3-5 words maximum) that summarizes the following question.\n\
         The title should be concise and descriptive. Do not use quotes or punctuation in the title.\n\n\
         Question: {question}\n\n\
         Title:"
    )
}
