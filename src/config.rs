//! Run modes and crate-wide configuration.
//!
//! A [`Mode`] fixes everything that varies between deliberation tiers: the
//! panelist pool, the moderator, the credit cost, whether peer review and
//! cross-review run, and how much context follow-up questions carry.
//! [`QuorumConfig`] bundles the three mode profiles with the upstream API
//! settings and input limits.

use std::collections::HashSet;

use crate::error::{QuorumError, Result};

/// Deliberation tier. Determines cost, panel composition, and which optional
/// stages run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Panel + synthesis only. No peer review.
    Quick,
    /// Panel + peer ranking + synthesis.
    Standard,
    /// Panel + cross-review refinement + peer ranking + synthesis.
    ExtraCare,
}

impl Mode {
    /// Parse a wire-format mode tag. Unknown tags are refused rather than
    /// aliased to a default.
    pub fn parse(tag: &str) -> Result<Mode> {
        match tag {
            "quick" => Ok(Mode::Quick),
            "standard" => Ok(Mode::Standard),
            "extra_care" => Ok(Mode::ExtraCare),
            other => Err(QuorumError::InvalidInput(format!(
                "unknown mode: {other:?}"
            ))),
        }
    }

    /// Wire-format tag, also used as the persisted `mode` column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Quick => "quick",
            Mode::Standard => "standard",
            Mode::ExtraCare => "extra_care",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much prior-run context a follow-up question carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextVerbosity {
    /// Prior answer only.
    Minimal,
    /// Prior answer plus dissenting excerpts.
    Standard,
    /// Prior answer plus dissent and aggregate rankings.
    Full,
}

/// Fixed configuration for one run mode.
#[derive(Debug, Clone)]
pub struct ModeProfile {
    /// Human-readable label, surfaced in run metadata.
    pub label: &'static str,
    /// Credits reserved per run in this mode.
    pub credit_cost: i64,
    /// Panelist endpoint identifiers queried in stage 1.
    pub panelists: Vec<String>,
    /// Endpoint that synthesizes the final answer in stage 3.
    pub moderator: String,
    /// Whether stage 2 (peer ranking) runs.
    pub peer_review: bool,
    /// Whether stage 1.5 (anonymized cross-review) runs.
    pub cross_review: bool,
    /// Context carried into follow-up questions.
    pub context_verbosity: ContextVerbosity,
}

/// Crate-wide configuration: mode profiles, upstream API settings, and input
/// limits. Constructed once at startup and threaded through the core context.
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// Upstream chat-completions endpoint URL.
    pub api_url: String,
    /// Bearer token for the upstream API.
    pub api_key: Option<String>,
    /// Profile for [`Mode::Quick`].
    pub quick: ModeProfile,
    /// Profile for [`Mode::Standard`].
    pub standard: ModeProfile,
    /// Profile for [`Mode::ExtraCare`].
    pub extra_care: ModeProfile,
    /// Endpoint used for the detached title-generation subtask.
    pub title_model: String,
    /// Endpoint used to describe images for text-only panelists.
    pub describe_model: String,
    /// Endpoints that accept image parts directly.
    pub vision_models: HashSet<String>,
    /// Extra credits reserved when a request carries attachments.
    pub attachment_credit_cost: i64,
    /// Maximum question length in characters.
    pub max_question_chars: usize,
    /// Maximum number of attachments per request.
    pub max_attachments: usize,
    /// Credits granted to a newly provisioned principal.
    pub starting_credits: i64,
}

impl QuorumConfig {
    /// Profile for the given mode.
    pub fn profile(&self, mode: Mode) -> &ModeProfile {
        match mode {
            Mode::Quick => &self.quick,
            Mode::Standard => &self.standard,
            Mode::ExtraCare => &self.extra_care,
        }
    }

    /// Set the API key, builder-style.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

fn standard_panel() -> Vec<String> {
    [
        "openai/gpt-5.2-chat",
        "anthropic/claude-sonnet-4.5",
        "google/gemini-3-flash-preview",
        "x-ai/grok-4-fast",
        "deepseek/deepseek-v3.2",
    ]
    .map(String::from)
    .to_vec()
}

fn extra_care_panel() -> Vec<String> {
    [
        "openai/gpt-5.2",
        "anthropic/claude-opus-4.5",
        "google/gemini-3-pro-preview",
        "x-ai/grok-4.1-fast",
        "deepseek/deepseek-v3.2",
    ]
    .map(String::from)
    .to_vec()
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            api_url: "https://openrouter.ai/api/v1/chat/completions".into(),
            api_key: None,
            quick: ModeProfile {
                label: "Quick Answer",
                credit_cost: 1,
                panelists: standard_panel(),
                moderator: "google/gemini-3-flash-preview".into(),
                peer_review: false,
                cross_review: false,
                context_verbosity: ContextVerbosity::Minimal,
            },
            standard: ModeProfile {
                label: "Standard Answer",
                credit_cost: 2,
                panelists: standard_panel(),
                moderator: "google/gemini-3-flash-preview".into(),
                peer_review: true,
                cross_review: false,
                context_verbosity: ContextVerbosity::Standard,
            },
            extra_care: ModeProfile {
                label: "Extra Care",
                credit_cost: 3,
                panelists: extra_care_panel(),
                moderator: "google/gemini-3-pro-preview".into(),
                peer_review: true,
                cross_review: true,
                context_verbosity: ContextVerbosity::Full,
            },
            title_model: "google/gemini-3-flash-preview".into(),
            describe_model: "google/gemini-3-flash-preview".into(),
            vision_models: [
                "openai/gpt-5.2-chat",
                "openai/gpt-5.2",
                "anthropic/claude-sonnet-4.5",
                "anthropic/claude-opus-4.5",
                "google/gemini-3-flash-preview",
                "google/gemini-3-pro-preview",
                "x-ai/grok-4-fast",
                "x-ai/grok-4.1-fast",
            ]
            .map(String::from)
            .into_iter()
            .collect(),
            attachment_credit_cost: 1,
            max_question_chars: 10_000,
            max_attachments: 5,
            starting_credits: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_roundtrip() {
        for mode in [Mode::Quick, Mode::Standard, Mode::ExtraCare] {
            assert_eq!(Mode::parse(mode.as_str()).unwrap(), mode);
        }
    }

    #[test]
    fn test_mode_parse_refuses_unknown() {
        assert!(Mode::parse("decide_please").is_err());
        assert!(Mode::parse("").is_err());
        assert!(Mode::parse("QUICK").is_err());
    }

    #[test]
    fn test_mode_costs_increase_with_tier() {
        let config = QuorumConfig::default();
        assert_eq!(config.profile(Mode::Quick).credit_cost, 1);
        assert_eq!(config.profile(Mode::Standard).credit_cost, 2);
        assert_eq!(config.profile(Mode::ExtraCare).credit_cost, 3);
    }

    #[test]
    fn test_stage_gates_per_mode() {
        let config = QuorumConfig::default();
        assert!(!config.quick.peer_review);
        assert!(!config.quick.cross_review);
        assert!(config.standard.peer_review);
        assert!(!config.standard.cross_review);
        assert!(config.extra_care.peer_review);
        assert!(config.extra_care.cross_review);
    }

    #[test]
    fn test_panel_has_five_seats() {
        let config = QuorumConfig::default();
        assert_eq!(config.quick.panelists.len(), 5);
        assert_eq!(config.extra_care.panelists.len(), 5);
    }
}
