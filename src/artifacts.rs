//! Stage artifact records and the tolerant JSON reader used at the store
//! boundary.
//!
//! Each pipeline stage produces a distinct record type. The transcript store
//! persists them as opaque JSON text; [`parse_json_field`] reads them back,
//! accepting both a plain JSON value and the doubly-encoded string shape some
//! historical rows carry.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// One panelist's answer from stage 1 (or its stage-1.5 refinement).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelResponse {
    /// Upstream endpoint identifier.
    pub model: String,
    /// The panelist's answer text.
    pub response: String,
    /// Set on stage-1.5 entries that went through cross-review.
    #[serde(default)]
    pub refined: bool,
}

/// One panelist's stage-2 ranking of the anonymized responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingBallot {
    /// Upstream endpoint identifier of the rater.
    pub model: String,
    /// Full ranking text as returned by the rater.
    pub ranking: String,
    /// Ordered labels (`"Response A"`, ...) parsed from the text.
    pub parsed_ranking: Vec<String>,
}

/// The moderator's stage-3 synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    /// Moderator endpoint identifier.
    pub model: String,
    /// Synthesized final answer text.
    pub response: String,
}

/// Mean rank position for one panelist across all stage-2 ballots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRank {
    /// Upstream endpoint identifier.
    pub model: String,
    /// Mean position, rounded to two decimals. Lower is better.
    pub average_rank: f64,
    /// Number of ballots that ranked this panelist.
    pub rankings_count: usize,
}

/// Derived context packet saved alongside a committed answer, consumed by
/// follow-up questions in the same deliberation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    /// The question the run answered.
    pub original_question: String,
    /// Condensed verdict, at most 800 characters.
    pub verdict_summary: String,
    /// Up to three excerpts from the lowest-ranked panelists.
    pub key_dissenting_points: Vec<String>,
    /// Aggregate rankings from stage 2, best first.
    pub aggregate_rankings: Vec<AggregateRank>,
    /// Panelists whose stage-1 responses back this summary.
    pub stage1_models: Vec<String>,
}

/// Best-effort TL;DR fields pulled from a prior synthesis for rerun context.
///
/// Purely advisory. Any field may be absent; nothing downstream may assume
/// structure in the upstream text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TldrPacket {
    pub recommendation: Option<String>,
    pub confidence: Option<String>,
    pub key_risks: Option<String>,
    pub tradeoffs: Option<String>,
    pub flip_condition: Option<String>,
    pub action_plan: Option<String>,
}

impl TldrPacket {
    /// True when no field was extracted.
    pub fn is_empty(&self) -> bool {
        self.recommendation.is_none()
            && self.confidence.is_none()
            && self.key_risks.is_none()
            && self.tradeoffs.is_none()
            && self.flip_condition.is_none()
            && self.action_plan.is_none()
    }
}

/// A fully committed answer read back from the transcript store.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    /// Message id assigned at commit.
    pub id: i64,
    /// Stage-1 panel responses.
    pub stage1: Vec<PanelResponse>,
    /// Stage-1.5 refinements, present only for cross-review runs.
    pub stage1_5: Option<Vec<PanelResponse>>,
    /// Stage-2 ballots. Empty for modes without peer review.
    pub stage2: Vec<RankingBallot>,
    /// Stage-3 synthesis. Always present on a committed answer.
    pub stage3: Synthesis,
    /// Mode tag the run used.
    pub mode: String,
    /// Whether this answer is a rerun of a prior one.
    pub is_rerun: bool,
    /// New input supplied with the rerun, if any.
    pub rerun_input: Option<String>,
    /// 0 for originals, `max(sibling revisions) + 1` for reruns.
    pub revision_number: i64,
    /// The answer this rerun chains to.
    pub parent_message_id: Option<i64>,
    /// Derived context packet, populated shortly after commit.
    pub context_summary: Option<ContextSummary>,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
}

/// A question message as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionRecord {
    pub id: i64,
    pub content: String,
    pub created_at: String,
}

/// One message in a deliberation view, questions and answers interleaved in
/// chronological order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum StoredMessage {
    User {
        id: i64,
        content: String,
        created_at: String,
    },
    Assistant(Answer),
}

/// Read a JSON column that may hold either the value itself or a JSON string
/// containing the value (some historical rows store one, some the other).
pub fn parse_json_field<T: DeserializeOwned>(raw: Option<String>) -> Option<T> {
    let raw = raw?;
    if let Ok(value) = serde_json::from_str::<T>(&raw) {
        return Some(value);
    }
    let inner: String = serde_json::from_str(&raw).ok()?;
    serde_json::from_str(&inner).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refined_defaults_to_false() {
        let parsed: PanelResponse =
            serde_json::from_str(r#"{"model":"m1","response":"text"}"#).unwrap();
        assert!(!parsed.refined);
    }

    #[test]
    fn test_parse_json_field_plain_value() {
        let raw = r#"[{"model":"m1","response":"hello"}]"#.to_string();
        let parsed: Vec<PanelResponse> = parse_json_field(Some(raw)).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].model, "m1");
    }

    #[test]
    fn test_parse_json_field_double_encoded() {
        let inner = r#"[{"model":"m1","response":"hello"}]"#;
        let raw = serde_json::to_string(inner).unwrap();
        let parsed: Vec<PanelResponse> = parse_json_field(Some(raw)).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].response, "hello");
    }

    #[test]
    fn test_parse_json_field_null_and_garbage() {
        let missing: Option<Vec<PanelResponse>> = parse_json_field(None);
        assert!(missing.is_none());
        let garbage: Option<Vec<PanelResponse>> = parse_json_field(Some("not json".into()));
        assert!(garbage.is_none());
    }

    #[test]
    fn test_tldr_packet_is_empty() {
        assert!(TldrPacket::default().is_empty());
        let packet = TldrPacket {
            recommendation: Some("ship it".into()),
            ..Default::default()
        };
        assert!(!packet.is_empty());
    }
}
