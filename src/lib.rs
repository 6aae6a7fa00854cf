//! # Quorum
//!
//! A multi-stage deliberation pipeline over independent LLM endpoints:
//! several **panelists** answer a question in parallel, optionally refine
//! their answers after an anonymized cross-review, rank one another's
//! responses, and a designated **moderator** synthesizes the final reply.
//! Progress streams to the caller as typed events while the run itself
//! survives client disconnects, crashes, and moderator misbehavior.
//!
//! ## Core Concepts
//!
//! - **[`QuorumCtx`]** — process-wide context (upstream client with its
//!   shared connection pool, transcript store, credit ledger, configuration).
//! - **[`Dispatcher`]** — accepts submissions, reserves credits, spawns
//!   detached scheduler tasks, and hands back an [`EventStream`].
//! - **[`scheduler`]** — the stage machine: gather, cross-review, rank,
//!   synthesize, commit. Emits [`RunEvent`]s and enforces credit refunds on
//!   every failure path.
//! - **[`TranscriptStore`]** — crash-safe persistence. Answers exist only
//!   through one atomic commit; there is no partial-row surface.
//! - **[`CreditLedger`]** — atomic conditional reservation with compensating
//!   refunds and a role-based bypass.
//! - **[`Upstream`]** — the LLM endpoint abstraction, with unary and
//!   streaming modes and transport-level retry.
//!
//! ## Quick Start
//!
//! ```no_run
//! use quorum::{Dispatcher, Principal, QuorumConfig, QuorumCtx, SubmitRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = QuorumConfig::default().with_api_key("sk-...");
//!     let ctx = QuorumCtx::open(config, "quorum.db").await?;
//!     let dispatcher = Dispatcher::new(ctx.clone());
//!
//!     let owner = Principal::user("user-1");
//!     ctx.store.get_or_create_user(&owner.id, None, 5).await?;
//!     let deliberation = ctx.store.create_deliberation(&owner.id).await?;
//!
//!     let mut events = dispatcher
//!         .submit(&owner, SubmitRequest {
//!             deliberation_id: deliberation.id,
//!             content: "Should we adopt the new storage engine?".into(),
//!             mode: "standard".into(),
//!             attachments: Vec::new(),
//!             source_answer_id: None,
//!         })
//!         .await?;
//!
//!     while let Some(event) = events.next().await {
//!         print!("{}", quorum::events::sse_frame(&event));
//!     }
//!     Ok(())
//! }
//! ```

pub mod artifacts;
pub mod attachments;
pub mod config;
pub mod context;
pub mod core;
pub mod dispatcher;
pub mod echo;
pub mod error;
pub mod events;
pub mod fanout;
pub mod ledger;
pub mod prompts;
pub mod ranking;
pub mod scheduler;
pub mod store;
pub mod upstream;

pub use artifacts::{
    AggregateRank, Answer, ContextSummary, PanelResponse, QuestionRecord, RankingBallot,
    StoredMessage, Synthesis, TldrPacket,
};
pub use attachments::{AttachmentKind, ProcessedFile};
pub use config::{ContextVerbosity, Mode, ModeProfile, QuorumConfig};
pub use crate::core::QuorumCtx;
pub use dispatcher::{Dispatcher, Principal, StatusReport, SubmitRequest};
pub use error::{QuorumError, Result};
pub use events::{EventQueue, EventStream, RunEvent};
pub use ledger::{CreditLedger, Role};
pub use scheduler::{ModeratorEvent, RunRequest, StageTracker};
pub use store::{AnswerDraft, DeliberationMeta, DeliberationPage, DeliberationView, TranscriptStore};
pub use upstream::{MockUpstream, OpenRouterUpstream, RetryPolicy, Upstream};
