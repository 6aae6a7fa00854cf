//! Parallel fan-out over the panelist pool.
//!
//! All endpoints are queried concurrently; identity is preserved in the
//! result order regardless of completion order. Per-endpoint failures are
//! absorbed to `None` after the transport retry gives up, and the remaining
//! panelists carry the deliberation.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use futures::future::join_all;

use crate::error::QuorumError;
use crate::upstream::{with_retry, ChatMessage, RetryPolicy, Upstream, UpstreamRequest};

/// Query each panelist with a per-endpoint message list built by `build`.
///
/// Returns `(model, Some(text))` for successes and `(model, None)` for
/// failures, in the order of `models`. There is no partial cancellation: a
/// failing endpoint never stops the others.
pub async fn fanout_with<F>(
    upstream: &Arc<dyn Upstream>,
    policy: &RetryPolicy,
    models: &[String],
    cancel: Option<&AtomicBool>,
    build: F,
) -> Vec<(String, Option<String>)>
where
    F: Fn(&str) -> Vec<ChatMessage>,
{
    let tasks = models.iter().map(|model| {
        let request = UpstreamRequest {
            model: model.clone(),
            messages: build(model),
        };
        async move {
            match with_retry(upstream, &request, policy, cancel).await {
                Ok(response) => (request.model, Some(response.text)),
                Err(QuorumError::Cancelled) => {
                    tracing::debug!(model = %request.model, "panel query cancelled");
                    (request.model, None)
                }
                Err(e) => {
                    tracing::warn!(model = %request.model, error = %e, "panelist dropped");
                    (request.model, None)
                }
            }
        }
    });

    join_all(tasks).await
}

/// Query every panelist with the same message list.
pub async fn query_panel_parallel(
    upstream: &Arc<dyn Upstream>,
    policy: &RetryPolicy,
    models: &[String],
    messages: &[ChatMessage],
    cancel: Option<&AtomicBool>,
) -> Vec<(String, Option<String>)> {
    fanout_with(upstream, policy, models, cancel, |_| messages.to_vec()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::mock::MockReply;
    use crate::upstream::MockUpstream;

    fn models(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_identity_preserved_in_input_order() {
        let mock = MockUpstream::new();
        mock.script_text("a", "answer-a");
        mock.script_text("b", "answer-b");
        mock.script_text("c", "answer-c");
        let upstream: Arc<dyn Upstream> = Arc::new(mock);

        let results = query_panel_parallel(
            &upstream,
            &RetryPolicy::none(),
            &models(&["a", "b", "c"]),
            &[ChatMessage::user("q")],
            None,
        )
        .await;

        let names: Vec<&str> = results.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(results[1].1.as_deref(), Some("answer-b"));
    }

    #[tokio::test]
    async fn test_partial_failure_collapses_to_none() {
        let mock = MockUpstream::new();
        mock.script_text("a", "fine");
        mock.script("b", MockReply::HttpFailure(500));
        mock.script_text("c", "also fine");
        let upstream: Arc<dyn Upstream> = Arc::new(mock);

        let results = query_panel_parallel(
            &upstream,
            &RetryPolicy::none(),
            &models(&["a", "b", "c"]),
            &[ChatMessage::user("q")],
            None,
        )
        .await;

        assert!(results[0].1.is_some());
        assert!(results[1].1.is_none());
        assert!(results[2].1.is_some());
    }

    #[tokio::test]
    async fn test_per_model_message_builder() {
        let mock = Arc::new(MockUpstream::fixed("ok"));
        let upstream: Arc<dyn Upstream> = mock.clone();

        fanout_with(
            &upstream,
            &RetryPolicy::none(),
            &models(&["a", "b"]),
            None,
            |model| vec![ChatMessage::user(format!("prompt for {model}"))],
        )
        .await;

        let mut calls = mock.calls();
        calls.sort();
        assert_eq!(
            calls,
            vec![
                ("a".to_string(), "prompt for a".to_string()),
                ("b".to_string(), "prompt for b".to_string()),
            ]
        );
    }
}
