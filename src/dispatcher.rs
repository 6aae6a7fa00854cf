//! Session dispatcher: accepts requests, guards the ledger, spawns scheduler
//! tasks, and multiplexes their event queues onto client-facing streams.
//!
//! The registry maps deliberation id to the live run's cancel flag and stage
//! tracker. The scheduler task is detached: it is owned by the process, not
//! by the response. Dropping the returned [`EventStream`] (client
//! disconnect) never cancels the run; explicit [`Dispatcher::cancel`] does,
//! cooperatively.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::artifacts::QuestionRecord;
use crate::attachments::{validate_attachments, ProcessedFile};
use crate::config::Mode;
use crate::core::QuorumCtx;
use crate::error::{QuorumError, Result};
use crate::events::{EventQueue, EventStream};
use crate::ledger::Role;
use crate::scheduler::{self, RunRequest, StageTracker};

/// The authenticated principal making a request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
        }
    }
}

/// A submission to one deliberation.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub deliberation_id: String,
    pub content: String,
    /// Wire-format mode tag; unknown tags are refused.
    pub mode: String,
    pub attachments: Vec<ProcessedFile>,
    /// Respond to a specific prior answer instead of the most recent one.
    pub source_answer_id: Option<i64>,
}

/// Poll result for a deliberation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub processing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub orphaned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphaned_message: Option<QuestionRecord>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub incomplete: bool,
}

impl StatusReport {
    fn idle() -> Self {
        Self {
            processing: false,
            current_stage: None,
            orphaned: false,
            orphaned_message: None,
            incomplete: false,
        }
    }
}

struct RunHandle {
    cancel: Arc<AtomicBool>,
    tracker: StageTracker,
}

/// Process-wide dispatcher. Cheap to clone; all clones share the registry.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<QuorumCtx>,
    registry: Arc<Mutex<HashMap<String, RunHandle>>>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<QuorumCtx>) -> Self {
        Self {
            ctx,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit a question and stream the run's events.
    ///
    /// Order matters for the error table: ownership and input validation
    /// reject before the ledger is touched; a reservation failure rejects
    /// before the question is appended.
    pub async fn submit(&self, principal: &Principal, request: SubmitRequest) -> Result<EventStream> {
        let mode = Mode::parse(&request.mode)?;
        self.validate_content(&request.content)?;
        self.ctx
            .store
            .assert_owner(&request.deliberation_id, &principal.id)
            .await?;
        validate_attachments(&request.attachments, &self.ctx.config)?;

        let credits_reserved = self
            .reserve_for(principal, mode, !request.attachments.is_empty())
            .await?;

        if let Err(e) = self
            .ctx
            .store
            .append_question(&request.deliberation_id, &request.content)
            .await
        {
            self.refund_reservation(principal, credits_reserved).await;
            return Err(e);
        }

        let is_first_question = self
            .ctx
            .store
            .last_answer(&request.deliberation_id)
            .await?
            .is_none();

        let run = RunRequest {
            deliberation_id: request.deliberation_id.clone(),
            principal: principal.id.clone(),
            question: request.content,
            mode,
            is_rerun: false,
            rerun_input: None,
            parent_answer_id: None,
            source_answer_id: request.source_answer_id,
            attachments: request.attachments,
            credits_reserved,
            generate_title: is_first_question,
        };
        Ok(self.spawn_run(run))
    }

    /// Re-execute the pipeline on the deliberation's original question,
    /// chained to a prior answer. `new_input` empty means second opinion.
    pub async fn rerun(
        &self,
        principal: &Principal,
        deliberation_id: &str,
        mode_tag: &str,
        new_input: Option<String>,
        parent_answer_id: Option<i64>,
    ) -> Result<EventStream> {
        let mode = Mode::parse(mode_tag)?;
        self.ctx
            .store
            .assert_owner(deliberation_id, &principal.id)
            .await?;
        let question = self
            .ctx
            .store
            .original_question(deliberation_id)
            .await?
            .ok_or_else(|| {
                QuorumError::InvalidInput("deliberation has no question to rerun".into())
            })?;

        let credits_reserved = self.reserve_for(principal, mode, false).await?;

        let run = RunRequest {
            deliberation_id: deliberation_id.to_string(),
            principal: principal.id.clone(),
            question,
            mode,
            is_rerun: true,
            rerun_input: new_input,
            parent_answer_id,
            source_answer_id: None,
            attachments: Vec::new(),
            credits_reserved,
            generate_title: false,
        };
        Ok(self.spawn_run(run))
    }

    /// Delete an orphaned question and re-dispatch it, so the final
    /// transcript carries exactly one question for the retried submission.
    pub async fn retry(
        &self,
        principal: &Principal,
        deliberation_id: &str,
        message_id: i64,
        mode_tag: &str,
    ) -> Result<EventStream> {
        self.ctx
            .store
            .assert_owner(deliberation_id, &principal.id)
            .await?;
        let question = self
            .ctx
            .store
            .question_by_id(deliberation_id, message_id)
            .await?
            .ok_or_else(|| QuorumError::NotFound(format!("message {message_id}")))?;
        self.ctx
            .store
            .delete_question_by_id(deliberation_id, message_id)
            .await?;

        self.submit(
            principal,
            SubmitRequest {
                deliberation_id: deliberation_id.to_string(),
                content: question.content,
                mode: mode_tag.to_string(),
                attachments: Vec::new(),
                source_answer_id: None,
            },
        )
        .await
    }

    /// Poll a deliberation's processing state.
    pub async fn status(&self, principal: &Principal, deliberation_id: &str) -> Result<StatusReport> {
        self.ctx
            .store
            .assert_owner(deliberation_id, &principal.id)
            .await?;

        if let Some(stage) = self.registered_stage(deliberation_id) {
            return Ok(StatusReport {
                processing: true,
                current_stage: Some(stage),
                ..StatusReport::idle()
            });
        }

        if let Some(orphan) = self.ctx.store.trailing_question(deliberation_id).await? {
            return Ok(StatusReport {
                orphaned: true,
                orphaned_message: Some(orphan),
                ..StatusReport::idle()
            });
        }
        if self.ctx.store.has_incomplete_answer(deliberation_id).await? {
            return Ok(StatusReport {
                incomplete: true,
                ..StatusReport::idle()
            });
        }
        Ok(StatusReport::idle())
    }

    /// Best-effort cooperative cancellation. Returns whether a live run was
    /// found. The scheduler observes the flag at its next suspension point
    /// and exits through the refund path.
    pub fn cancel(&self, deliberation_id: &str) -> bool {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        match registry.remove(deliberation_id) {
            Some(handle) => {
                handle.cancel.store(true, Ordering::Relaxed);
                tracing::info!(deliberation = %deliberation_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Delete a question message (user-question only, owner-checked).
    pub async fn delete_question(
        &self,
        principal: &Principal,
        deliberation_id: &str,
        message_id: i64,
    ) -> Result<()> {
        self.ctx
            .store
            .assert_owner(deliberation_id, &principal.id)
            .await?;
        self.ctx
            .store
            .delete_question_by_id(deliberation_id, message_id)
            .await
    }

    fn validate_content(&self, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(QuorumError::InvalidInput("question is empty".into()));
        }
        let max = self.ctx.config.max_question_chars;
        if content.chars().count() > max {
            return Err(QuorumError::InvalidInput(format!(
                "question exceeds {max} characters"
            )));
        }
        Ok(())
    }

    async fn reserve_for(
        &self,
        principal: &Principal,
        mode: Mode,
        has_attachments: bool,
    ) -> Result<i64> {
        if principal.role.bypasses_ledger() {
            return Ok(0);
        }
        let mut cost = self.ctx.config.profile(mode).credit_cost;
        if has_attachments {
            cost += self.ctx.config.attachment_credit_cost;
        }
        self.ctx.ledger.reserve(&principal.id, cost).await?;
        Ok(cost)
    }

    async fn refund_reservation(&self, principal: &Principal, credits: i64) {
        if credits > 0 {
            if let Err(e) = self.ctx.ledger.refund(&principal.id, credits).await {
                tracing::error!(error = %e, "compensating refund failed");
            }
        }
    }

    fn registered_stage(&self, deliberation_id: &str) -> Option<String> {
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry.get(deliberation_id).map(|h| h.tracker.get())
    }

    /// Spawn the detached scheduler task and register it. The task clears
    /// its own registry entry after posting the terminal event, so `status`
    /// flips from processing to settled exactly once.
    fn spawn_run(&self, run: RunRequest) -> EventStream {
        let (queue, stream) = EventQueue::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let tracker = StageTracker::new();

        let deliberation_id = run.deliberation_id.clone();
        {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry.insert(
                deliberation_id.clone(),
                RunHandle {
                    cancel: cancel.clone(),
                    tracker: tracker.clone(),
                },
            );
        }

        let ctx = self.ctx.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            scheduler::run(ctx, run, queue, cancel, tracker).await;
            registry
                .lock()
                .expect("registry lock poisoned")
                .remove(&deliberation_id);
        });

        stream
    }
}
