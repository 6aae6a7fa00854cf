//! Run event protocol and the queue that decouples producers from consumers.
//!
//! The scheduler pushes [`RunEvent`]s into an unbounded queue as it advances
//! through the stages. The dispatcher hands the receiving half to the caller
//! as an [`EventStream`], which ends once it observes a terminal event
//! (`complete` or `error`). Dropping the stream never affects the producer:
//! the scheduler keeps writing into the queue and commits regardless of
//! whether a reader is attached.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::artifacts::{AggregateRank, PanelResponse, RankingBallot, Synthesis};

/// Stage-2 metadata attached to ranking and synthesis events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingMetadata {
    /// Anonymous label (`"Response A"`) to endpoint identifier.
    pub label_to_model: BTreeMap<String, String>,
    /// Mean rank per panelist, best first.
    pub aggregate_rankings: Vec<AggregateRank>,
}

/// Events emitted while a deliberation runs.
///
/// Serializes to the wire envelope `{"type": "...", ...}` used by the
/// server-sent-event transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run was accepted and the pipeline is starting.
    RunStarted {
        mode: String,
        is_rerun: bool,
        is_followup: bool,
    },
    /// The effective query is being prepared for the next stage.
    StagePreparing { next_stage: String, status: String },
    Stage1Start,
    /// Periodic liveness signal emitted during long phases.
    Heartbeat {
        operation: String,
        elapsed_seconds: u64,
    },
    Stage1Complete { data: Vec<PanelResponse> },
    #[serde(rename = "stage1_5_start")]
    Stage15Start,
    #[serde(rename = "stage1_5_complete")]
    Stage15Complete { data: Vec<PanelResponse> },
    #[serde(rename = "stage1_5_skipped")]
    Stage15Skipped { reason: String },
    Stage2Start,
    Stage2Complete {
        data: Vec<RankingBallot>,
        metadata: RankingMetadata,
    },
    Stage2Skipped { reason: String },
    Stage3Start,
    Stage3Complete {
        data: Synthesis,
        metadata: RankingMetadata,
    },
    /// The detached title subtask finished and the deliberation was renamed.
    TitleComplete { title: String },
    /// Terminal: the answer was committed.
    Complete {
        credits: i64,
        mode: String,
        message_id: i64,
    },
    /// Terminal: the run failed and reserved credits were refunded.
    Error { message: String },
    /// The moderator echoed the question; a stricter prompt is being issued.
    Retry { reason: String },
}

impl RunEvent {
    /// True for the two events that terminate a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Complete { .. } | RunEvent::Error { .. })
    }
}

/// Frame an event for the server-sent-event transport: `data: <json>\n\n`.
pub fn sse_frame(event: &RunEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| String::from("{}"));
    format!("data: {json}\n\n")
}

/// Response headers the HTTP adapter must set on the event stream: disable
/// intermediate buffering and request chunked transfer.
pub const SSE_HEADERS: &[(&str, &str)] = &[
    ("Content-Type", "text/event-stream"),
    ("Cache-Control", "no-cache"),
    ("Connection", "keep-alive"),
    ("X-Accel-Buffering", "no"),
    ("Transfer-Encoding", "chunked"),
];

/// Producer half of a run's event queue. Cheap to clone; pushes never block
/// and never fail -- events for a detached reader are simply dropped.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl EventQueue {
    /// Create a queue and its consuming stream.
    pub fn channel() -> (EventQueue, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventQueue { tx },
            EventStream {
                rx,
                finished: false,
            },
        )
    }

    /// Enqueue an event. A missing reader is not an error.
    pub fn push(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }
}

/// Consumer half of a run's event queue.
///
/// Yields events in emission order and ends after the terminal event. The
/// terminal event acts as the sentinel: once `complete` or `error` has been
/// returned, `next` yields `None` forever.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<RunEvent>,
    finished: bool,
}

impl EventStream {
    /// Receive the next event, or `None` once the stream has terminated.
    pub async fn next(&mut self) -> Option<RunEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Some(event)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Drain every remaining event into a vector. Test and batch helper.
    pub async fn collect(mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_tags() {
        let cases: Vec<(RunEvent, &str)> = vec![
            (
                RunEvent::RunStarted {
                    mode: "quick".into(),
                    is_rerun: false,
                    is_followup: false,
                },
                "run_started",
            ),
            (RunEvent::Stage1Start, "stage1_start"),
            (RunEvent::Stage15Start, "stage1_5_start"),
            (
                RunEvent::Stage15Skipped {
                    reason: "x".into(),
                },
                "stage1_5_skipped",
            ),
            (RunEvent::Stage2Start, "stage2_start"),
            (RunEvent::Stage3Start, "stage3_start"),
            (
                RunEvent::Heartbeat {
                    operation: "stage1".into(),
                    elapsed_seconds: 4,
                },
                "heartbeat",
            ),
            (
                RunEvent::TitleComplete {
                    title: "t".into(),
                },
                "title_complete",
            ),
            (
                RunEvent::Retry {
                    reason: "echo_detected".into(),
                },
                "retry",
            ),
        ];
        for (event, tag) in cases {
            let json: serde_json::Value =
                serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
            assert_eq!(json["type"], tag, "wrong tag for {event:?}");
        }
    }

    #[test]
    fn test_sse_frame_shape() {
        let frame = sse_frame(&RunEvent::Stage1Start);
        assert_eq!(frame, "data: {\"type\":\"stage1_start\"}\n\n");
    }

    #[test]
    fn test_terminal_events() {
        assert!(RunEvent::Complete {
            credits: 1,
            mode: "quick".into(),
            message_id: 7
        }
        .is_terminal());
        assert!(RunEvent::Error {
            message: "boom".into()
        }
        .is_terminal());
        assert!(!RunEvent::Stage1Start.is_terminal());
    }

    #[tokio::test]
    async fn test_stream_ends_at_terminal_event() {
        let (queue, mut stream) = EventQueue::channel();
        queue.push(RunEvent::Stage1Start);
        queue.push(RunEvent::Complete {
            credits: 1,
            mode: "quick".into(),
            message_id: 1,
        });
        queue.push(RunEvent::Stage2Start); // must never be observed

        assert!(matches!(stream.next().await, Some(RunEvent::Stage1Start)));
        assert!(matches!(stream.next().await, Some(RunEvent::Complete { .. })));
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_push_after_reader_drop_is_silent() {
        let (queue, stream) = EventQueue::channel();
        drop(stream);
        queue.push(RunEvent::Stage1Start); // no panic, no error
    }
}
