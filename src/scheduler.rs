//! Pipeline scheduler: drives the stage machine for one deliberation.
//!
//! States: `PREP → S1 → (S1.5) → (S2) → S3 → COMMIT → DONE`, with `FAILED`
//! reachable from anywhere. Progress is pushed into the run's event queue;
//! the terminal `complete`/`error` event doubles as the stream sentinel.
//!
//! Credit conservation: the dispatcher reserves before spawning this task;
//! every failure path below refunds exactly that reservation before the
//! terminal event is posted, and the success path never refunds.
//!
//! Cancellation is cooperative: the flag is observed at stage boundaries and
//! inside the retry wrapper, and takes the FAILED branch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::artifacts::{PanelResponse, RankingBallot, Synthesis};
use crate::attachments::{self, ProcessedFile};
use crate::config::{Mode, ModeProfile};
use crate::context;
use crate::core::QuorumCtx;
use crate::echo;
use crate::error::{QuorumError, Result};
use crate::events::{EventQueue, RankingMetadata, RunEvent};
use crate::fanout;
use crate::prompts;
use crate::ranking;
use crate::store::AnswerDraft;
use crate::upstream::{with_retry, ChatMessage, UpstreamRequest};

/// Cadence of the liveness heartbeat during long phases. Two seconds keeps
/// buffering-averse transports from timing out on silent gaps.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
/// Budget for the detached title-generation subtask.
const TITLE_TIMEOUT: Duration = Duration::from_secs(30);
const TITLE_MAX_CHARS: usize = 50;

/// Fallback stage-3 text when the moderator fails outright.
const MODERATOR_UNAVAILABLE_TEXT: &str = "Error: Unable to generate final synthesis.";

/// Input to one scheduler run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub deliberation_id: String,
    pub principal: String,
    /// The user's raw question (or the original question, for reruns).
    pub question: String,
    pub mode: Mode,
    pub is_rerun: bool,
    /// New input supplied with a rerun; empty means second opinion.
    pub rerun_input: Option<String>,
    /// Answer the rerun chains to. Defaults to the most recent one.
    pub parent_answer_id: Option<i64>,
    /// Prior answer a follow-up responds to. Defaults to the most recent one.
    pub source_answer_id: Option<i64>,
    pub attachments: Vec<ProcessedFile>,
    /// Credits reserved by the dispatcher; 0 when the role bypasses the
    /// ledger. Refunded in full on any failure path.
    pub credits_reserved: i64,
    /// Spawn the detached title subtask (first question only).
    pub generate_title: bool,
}

/// Shared, lock-protected view of the stage a run is currently in.
#[derive(Clone)]
pub struct StageTracker(Arc<std::sync::Mutex<String>>);

impl StageTracker {
    pub fn new() -> Self {
        Self(Arc::new(std::sync::Mutex::new("prep".to_string())))
    }

    pub(crate) fn set(&self, stage: &str) {
        *self.0.lock().expect("stage tracker lock poisoned") = stage.to_string();
    }

    pub fn get(&self) -> String {
        self.0.lock().expect("stage tracker lock poisoned").clone()
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Companion task that pushes a heartbeat every two seconds until dropped.
/// Dropping the guard aborts the task, so cancellation is deterministic at
/// the phase boundary.
struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl HeartbeatGuard {
    fn start(queue: EventQueue, operation: &'static str) -> Self {
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                queue.push(RunEvent::Heartbeat {
                    operation: operation.to_string(),
                    elapsed_seconds: started.elapsed().as_secs(),
                });
            }
        });
        Self { handle }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn check_cancelled(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        return Err(QuorumError::Cancelled);
    }
    Ok(())
}

/// Run one deliberation to completion. Always posts a terminal event.
pub async fn run(
    ctx: Arc<QuorumCtx>,
    request: RunRequest,
    queue: EventQueue,
    cancel: Arc<AtomicBool>,
    tracker: StageTracker,
) {
    let credits = request.credits_reserved;
    match run_pipeline(&ctx, &request, &queue, &cancel, &tracker).await {
        Ok(message_id) => {
            tracker.set("done");
            queue.push(RunEvent::Complete {
                credits,
                mode: request.mode.as_str().to_string(),
                message_id,
            });
        }
        Err(e) => {
            tracker.set("failed");
            tracing::error!(
                deliberation = %request.deliberation_id,
                error = %e,
                "deliberation run failed"
            );
            if credits > 0 {
                if let Err(refund_err) = ctx.ledger.refund(&request.principal, credits).await {
                    tracing::error!(error = %refund_err, "compensating refund failed");
                }
            }
            queue.push(RunEvent::Error {
                message: e.to_string(),
            });
        }
    }
}

async fn run_pipeline(
    ctx: &Arc<QuorumCtx>,
    request: &RunRequest,
    queue: &EventQueue,
    cancel: &AtomicBool,
    tracker: &StageTracker,
) -> Result<i64> {
    let profile = ctx.config.profile(request.mode).clone();
    tracker.set("prep");

    let prior_answer = if request.is_rerun {
        None
    } else {
        ctx.store.last_answer(&request.deliberation_id).await?
    };
    let is_followup = prior_answer.is_some();

    queue.push(RunEvent::RunStarted {
        mode: request.mode.as_str().to_string(),
        is_rerun: request.is_rerun,
        is_followup,
    });

    let title_task = if request.generate_title && !request.is_rerun && !is_followup {
        Some(spawn_title_task(ctx.clone(), request.question.clone()))
    } else {
        None
    };

    queue.push(RunEvent::StagePreparing {
        next_stage: "stage1".to_string(),
        status: "building effective query".to_string(),
    });
    let (effective_query, parent_message_id) =
        build_effective_query(ctx, request, &profile, prior_answer.as_ref()).await?;

    // ── S1: gather ─────────────────────────────────────────────────────
    check_cancelled(cancel)?;
    tracker.set("stage1");
    queue.push(RunEvent::Stage1Start);
    let stage1 = {
        let _hb = HeartbeatGuard::start(queue.clone(), "stage1");
        collect_stage1(ctx, request, &profile, &effective_query, cancel).await
    };
    check_cancelled(cancel)?;
    if stage1.is_empty() {
        return Err(QuorumError::AllPanelistsFailed);
    }
    queue.push(RunEvent::Stage1Complete {
        data: stage1.clone(),
    });

    // ── S1.5: cross-review ─────────────────────────────────────────────
    let mut responses_for_ranking = stage1.clone();
    let mut stage1_5: Option<Vec<PanelResponse>> = None;
    if profile.cross_review {
        tracker.set("stage1_5");
        queue.push(RunEvent::Stage15Start);
        let refined = {
            let _hb = HeartbeatGuard::start(queue.clone(), "stage1_5");
            cross_review(ctx, &profile, &effective_query, &stage1, cancel).await
        };
        check_cancelled(cancel)?;
        if refined.is_empty() {
            queue.push(RunEvent::Stage15Skipped {
                reason: "no refined responses".to_string(),
            });
        } else {
            responses_for_ranking = refined.clone();
            stage1_5 = Some(refined.clone());
            queue.push(RunEvent::Stage15Complete { data: refined });
        }
    }

    // ── S2: rank ───────────────────────────────────────────────────────
    let mut ballots: Vec<RankingBallot> = Vec::new();
    let mut metadata = RankingMetadata::default();
    if profile.peer_review {
        check_cancelled(cancel)?;
        tracker.set("stage2");
        queue.push(RunEvent::Stage2Start);
        let label_to_model = ranking::label_table(&responses_for_ranking);
        let prompt = prompts::ranking_prompt(&effective_query, &responses_for_ranking);
        let results = {
            let _hb = HeartbeatGuard::start(queue.clone(), "stage2");
            fanout::query_panel_parallel(
                &ctx.upstream,
                &ctx.retry,
                &profile.panelists,
                &[ChatMessage::user(prompt)],
                Some(cancel),
            )
            .await
        };
        check_cancelled(cancel)?;
        ballots = results
            .into_iter()
            .filter_map(|(model, text)| text.map(|t| ranking::ballot_from_reply(&model, t)))
            .collect();
        if ballots.is_empty() {
            queue.push(RunEvent::Stage2Skipped {
                reason: "no rankings returned".to_string(),
            });
        } else {
            metadata = RankingMetadata {
                aggregate_rankings: ranking::aggregate_rankings(&ballots, &label_to_model),
                label_to_model,
            };
            queue.push(RunEvent::Stage2Complete {
                data: ballots.clone(),
                metadata: metadata.clone(),
            });
        }
    } else {
        queue.push(RunEvent::Stage2Skipped {
            reason: "peer review not enabled for this mode".to_string(),
        });
    }

    // ── S3: synthesize ─────────────────────────────────────────────────
    check_cancelled(cancel)?;
    tracker.set("stage3");
    queue.push(RunEvent::Stage3Start);
    let synthesis = {
        let _hb = HeartbeatGuard::start(queue.clone(), "stage3");
        synthesize(
            ctx,
            queue,
            &effective_query,
            &responses_for_ranking,
            &ballots,
            &profile.moderator,
            cancel,
        )
        .await?
    };
    check_cancelled(cancel)?;
    queue.push(RunEvent::Stage3Complete {
        data: synthesis.clone(),
        metadata: metadata.clone(),
    });

    // ── COMMIT ─────────────────────────────────────────────────────────
    tracker.set("commit");
    let draft = AnswerDraft {
        stage1: stage1.clone(),
        stage1_5,
        stage2: ballots,
        stage3: synthesis.clone(),
        mode: request.mode.as_str().to_string(),
        is_rerun: request.is_rerun,
        rerun_input: request.rerun_input.clone(),
        parent_message_id,
    };
    let message_id = ctx.store.commit_answer(&request.deliberation_id, &draft).await?;

    let summary = context::build_context_summary(
        &request.question,
        &stage1,
        &metadata.aggregate_rankings,
        &synthesis.response,
    );
    if let Err(e) = ctx.store.save_context_summary(message_id, &summary).await {
        // The answer is committed; a lost summary only degrades follow-ups.
        tracing::warn!(message_id, error = %e, "context summary not saved");
    }

    if let Some(task) = title_task {
        if let Ok(Some(title)) = task.await {
            match ctx.store.update_title(&request.deliberation_id, &title).await {
                Ok(()) => queue.push(RunEvent::TitleComplete { title }),
                Err(e) => tracing::warn!(error = %e, "title update failed"),
            }
        }
    }

    Ok(message_id)
}

/// Derive the effective query and, for reruns, the parent answer id.
async fn build_effective_query(
    ctx: &Arc<QuorumCtx>,
    request: &RunRequest,
    profile: &ModeProfile,
    prior_answer: Option<&crate::artifacts::Answer>,
) -> Result<(String, Option<i64>)> {
    if request.is_rerun {
        let source = match request.parent_answer_id {
            Some(id) => ctx.store.answer_by_id(&request.deliberation_id, id).await?,
            None => ctx.store.last_answer(&request.deliberation_id).await?,
        };
        let Some(answer) = source else {
            return Ok((request.question.clone(), None));
        };
        let packet = context::extract_tldr_packet(&answer.stage3.response);
        let original = ctx
            .store
            .original_question(&request.deliberation_id)
            .await?
            .unwrap_or_else(|| request.question.clone());
        let query =
            context::build_rerun_query(&original, &packet, request.rerun_input.as_deref());
        return Ok((query, Some(answer.id)));
    }

    if prior_answer.is_some() {
        let source = match request.source_answer_id {
            Some(id) => ctx.store.answer_by_id(&request.deliberation_id, id).await?,
            None => prior_answer.cloned(),
        };
        if let Some(answer) = source {
            let query = context::build_followup_query(
                &answer.stage3.response,
                answer.context_summary.as_ref(),
                profile.context_verbosity,
                &request.question,
            );
            return Ok((query, None));
        }
    }

    Ok((request.question.clone(), None))
}

/// Query the panel, threading attachments in per endpoint capability.
async fn collect_stage1(
    ctx: &Arc<QuorumCtx>,
    request: &RunRequest,
    profile: &ModeProfile,
    effective_query: &str,
    cancel: &AtomicBool,
) -> Vec<PanelResponse> {
    let results = if request.attachments.is_empty() {
        fanout::query_panel_parallel(
            &ctx.upstream,
            &ctx.retry,
            &profile.panelists,
            &[ChatMessage::user(effective_query)],
            Some(cancel),
        )
        .await
    } else {
        let descriptions = if attachments::needs_image_descriptions(
            &request.attachments,
            &profile.panelists,
            &ctx.config.vision_models,
        ) {
            attachments::describe_images(
                &ctx.upstream,
                &ctx.retry,
                &ctx.config.describe_model,
                &request.attachments,
            )
            .await
        } else {
            HashMap::new()
        };
        fanout::fanout_with(
            &ctx.upstream,
            &ctx.retry,
            &profile.panelists,
            Some(cancel),
            |model| {
                vec![attachments::build_multimodal_message(
                    effective_query,
                    &request.attachments,
                    model,
                    &ctx.config.vision_models,
                    &descriptions,
                )]
            },
        )
        .await
    };

    results
        .into_iter()
        .filter_map(|(model, text)| {
            text.map(|response| PanelResponse {
                model,
                response,
                refined: false,
            })
        })
        .collect()
}

/// Stage 1.5: each panelist sees its own response verbatim and the others
/// shuffled and relabeled, then refines its answer.
async fn cross_review(
    ctx: &Arc<QuorumCtx>,
    profile: &ModeProfile,
    effective_query: &str,
    stage1: &[PanelResponse],
    cancel: &AtomicBool,
) -> Vec<PanelResponse> {
    let results = fanout::fanout_with(
        &ctx.upstream,
        &ctx.retry,
        &profile.panelists,
        Some(cancel),
        |model| {
            let own = stage1
                .iter()
                .find(|r| r.model == model)
                .map(|r| r.response.as_str())
                .unwrap_or("");
            let mut others: Vec<&PanelResponse> =
                stage1.iter().filter(|r| r.model != model).collect();
            // Fresh shuffle per endpoint: no rater can correlate labels
            // across prompts.
            fastrand::shuffle(&mut others);
            vec![ChatMessage::user(prompts::cross_review_prompt(
                effective_query,
                own,
                &others,
            ))]
        },
    )
    .await;

    results
        .into_iter()
        .filter_map(|(model, text)| {
            text.map(|response| PanelResponse {
                model,
                response,
                refined: true,
            })
        })
        .collect()
}

/// Stage 3: unary synthesis with echo detection, salvage, one strict retry,
/// and canned fallbacks. Moderator failure never escalates; the fallback
/// text still counts as a committed stage 3.
async fn synthesize(
    ctx: &Arc<QuorumCtx>,
    queue: &EventQueue,
    effective_query: &str,
    responses: &[PanelResponse],
    ballots: &[RankingBallot],
    moderator: &str,
    cancel: &AtomicBool,
) -> Result<Synthesis> {
    let prompt = prompts::synthesis_prompt(effective_query, responses, ballots);
    let request = UpstreamRequest::simple(moderator, prompt);

    let mut content = match with_retry(&ctx.upstream, &request, &ctx.retry, Some(cancel)).await {
        Err(QuorumError::Cancelled) => return Err(QuorumError::Cancelled),
        Ok(resp) if !resp.text.trim().is_empty() => resp.text,
        Ok(_) => {
            tracing::error!(moderator, "moderator returned an empty synthesis");
            return Ok(Synthesis {
                model: moderator.to_string(),
                response: MODERATOR_UNAVAILABLE_TEXT.to_string(),
            });
        }
        Err(e) => {
            tracing::error!(moderator, error = %e, "moderator failed");
            return Ok(Synthesis {
                model: moderator.to_string(),
                response: MODERATOR_UNAVAILABLE_TEXT.to_string(),
            });
        }
    };

    if echo::detect_echo(effective_query, &content) {
        tracing::warn!(moderator, "moderator response echoes the question");
        if let Some(salvaged) = echo::salvage_synthesis(effective_query, &content) {
            content = salvaged;
        } else {
            queue.push(RunEvent::Retry {
                reason: "echo_detected".to_string(),
            });
            let retry_prompt = prompts::strict_synthesis_retry_prompt(effective_query, responses);
            let retry_request = UpstreamRequest::simple(moderator, retry_prompt);
            content =
                match with_retry(&ctx.upstream, &retry_request, &ctx.retry, Some(cancel)).await {
                    Err(QuorumError::Cancelled) => return Err(QuorumError::Cancelled),
                    Ok(resp) if !resp.text.trim().is_empty() => {
                        let retry_content = resp.text.trim().to_string();
                        if echo::retry_still_echoes(effective_query, &retry_content) {
                            tracing::warn!(moderator, "retry also echoed, using fallback text");
                            echo::ECHO_FALLBACK_TEXT.to_string()
                        } else {
                            retry_content
                        }
                    }
                    _ => {
                        tracing::error!(moderator, "moderator retry failed");
                        echo::MODERATOR_FAILED_TEXT.to_string()
                    }
                };
        }
    }

    Ok(Synthesis {
        model: moderator.to_string(),
        response: content,
    })
}

/// Events surfaced by the streaming synthesis variant.
#[derive(Debug, Clone)]
pub enum ModeratorEvent {
    /// Text released past the echo guard, safe to forward to the client.
    Token(String),
    /// Echo detected in the withheld prefix; a strict retry is starting.
    Retry { reason: String },
    /// The synthesis finished.
    Complete(Synthesis),
    /// The stream failed terminally.
    Error(String),
}

/// Streaming stage-3 synthesis for token-forwarding adapters.
///
/// Tokens are withheld behind a 300-character prefix buffer; the echo check
/// runs once when the buffer fills (or at end-of-stream for short outputs).
/// A clean buffer is flushed and the rest streams through. On echo, nothing
/// of the first attempt is released and the strict retry streams instead.
pub async fn synthesize_streaming(
    ctx: &QuorumCtx,
    effective_query: &str,
    responses: &[PanelResponse],
    ballots: &[RankingBallot],
    moderator: &str,
    on_event: &mut (dyn FnMut(ModeratorEvent) + Send),
) -> Result<Synthesis> {
    let prompt = prompts::synthesis_prompt(effective_query, responses, ballots);
    let request = UpstreamRequest::simple(moderator, prompt);

    let mut guard = echo::StreamEchoGuard::new(effective_query);
    let mut full = String::new();
    let result = {
        let mut forward = |token: &str| {
            full.push_str(token);
            if let Some(out) = guard.push(token) {
                on_event(ModeratorEvent::Token(out));
            }
        };
        ctx.upstream.complete_streaming(&request, &mut forward).await
    };

    match result {
        Ok(_) => {
            if let Some(tail) = guard.finish() {
                on_event(ModeratorEvent::Token(tail));
            }
            if !guard.echo_detected() {
                let synthesis = Synthesis {
                    model: moderator.to_string(),
                    response: full,
                };
                on_event(ModeratorEvent::Complete(synthesis.clone()));
                return Ok(synthesis);
            }
        }
        Err(e) => {
            on_event(ModeratorEvent::Error(e.to_string()));
            return Err(e);
        }
    }

    // Echoed opening was withheld in full; stream the strict retry instead.
    tracing::warn!(moderator, "streamed synthesis echoed the question, retrying");
    on_event(ModeratorEvent::Retry {
        reason: "echo_detected".to_string(),
    });
    let retry_prompt = prompts::strict_synthesis_retry_prompt(effective_query, responses);
    let retry_request = UpstreamRequest::simple(moderator, retry_prompt);

    let mut retry_full = String::new();
    let result = {
        let mut forward = |token: &str| {
            retry_full.push_str(token);
            on_event(ModeratorEvent::Token(token.to_string()));
        };
        ctx.upstream
            .complete_streaming(&retry_request, &mut forward)
            .await
    };

    match result {
        Ok(_) if !retry_full.trim().is_empty() => {
            let synthesis = Synthesis {
                model: moderator.to_string(),
                response: retry_full,
            };
            on_event(ModeratorEvent::Complete(synthesis.clone()));
            Ok(synthesis)
        }
        _ => {
            let message = "unable to generate synthesis after retry".to_string();
            on_event(ModeratorEvent::Error(message.clone()));
            Err(QuorumError::Other(message))
        }
    }
}

fn spawn_title_task(ctx: Arc<QuorumCtx>, question: String) -> JoinHandle<Option<String>> {
    tokio::spawn(async move {
        let request =
            UpstreamRequest::simple(ctx.config.title_model.clone(), prompts::title_prompt(&question));
        match tokio::time::timeout(TITLE_TIMEOUT, ctx.upstream.complete(&request)).await {
            Ok(Ok(resp)) => {
                let title = clean_title(&resp.text);
                if title.is_empty() {
                    None
                } else {
                    Some(title)
                }
            }
            _ => {
                tracing::debug!("title generation failed");
                None
            }
        }
    })
}

fn clean_title(raw: &str) -> String {
    let title = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    if title.chars().count() > TITLE_MAX_CHARS {
        prompts::truncate_chars(title, TITLE_MAX_CHARS - 3)
    } else {
        title.to_string()
    }
}
