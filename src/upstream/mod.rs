//! Upstream client trait and normalized request/response types.
//!
//! The [`Upstream`] trait abstracts over the LLM endpoint service. One
//! implementation talks to an OpenAI-compatible chat-completions API
//! ([`OpenRouterUpstream`]); [`MockUpstream`] scripts responses for tests.
//!
//! ```text
//! Scheduler ──► UpstreamRequest ──► Upstream::complete() ──► UpstreamResponse
//!                                          │
//!                              ┌───────────┴───────────┐
//!                       OpenRouterUpstream        MockUpstream
//!                       POST chat/completions     scripted replies
//!                       SSE delta streaming
//! ```

pub mod backoff;
pub mod mock;
pub mod openrouter;
pub mod sse;

pub use backoff::RetryPolicy;
pub use mock::MockUpstream;
pub use openrouter::OpenRouterUpstream;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{QuorumError, Result};

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single part of a multimodal message body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Image reference carried in an [`ContentPart::ImageUrl`] part.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    /// Data URI or remote URL.
    pub url: String,
}

/// Message content: either plain text or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flatten to plain text. Image parts are skipped.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: MessageContent,
}

impl ChatMessage {
    /// A plain-text user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Text(text.into()),
        }
    }

    /// A multi-part user message (text and image parts).
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Parts(parts),
        }
    }
}

/// A normalized upstream request: one endpoint, one ordered message list.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// Endpoint identifier (e.g. `"openai/gpt-5.2-chat"`).
    pub model: String,
    /// Ordered conversation to send.
    pub messages: Vec<ChatMessage>,
}

impl UpstreamRequest {
    /// Single-user-message request, the common case.
    pub fn simple(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::user(text)],
        }
    }
}

/// A normalized upstream response.
#[derive(Debug)]
pub struct UpstreamResponse {
    /// The generated text content.
    pub text: String,
    /// HTTP status code (for diagnostics).
    pub status: u16,
    /// Provider-specific auxiliary details (token counts, reasoning traces).
    pub metadata: Option<serde_json::Value>,
}

/// Abstraction over the upstream LLM endpoint service.
///
/// Two modes: unary completion, and streaming completion where `on_token` is
/// invoked for each token as it arrives and the accumulated text is returned.
/// A stream is finite and is not restartable by the caller; transport-level
/// retry restarts it from scratch inside [`with_retry_streaming`].
///
/// Object-safe; used as `Arc<dyn Upstream>`.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Execute a unary call.
    async fn complete(&self, request: &UpstreamRequest) -> Result<UpstreamResponse>;

    /// Execute a streaming call, invoking `on_token` per token.
    async fn complete_streaming(
        &self,
        request: &UpstreamRequest,
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<UpstreamResponse>;

    /// Human-readable name for logging.
    fn name(&self) -> &'static str;
}

/// Check whether an error is retryable under the given policy.
///
/// Retryable: [`QuorumError::HttpError`] with a status in
/// `policy.retryable_statuses`, and transport-level [`QuorumError::Request`]
/// failures. Everything else fails immediately.
pub fn is_retryable(error: &QuorumError, policy: &RetryPolicy) -> bool {
    match error {
        QuorumError::HttpError { status, .. } => policy.retryable_statuses.contains(status),
        QuorumError::Request(_) => true,
        _ => false,
    }
}

fn cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

/// Execute a unary call with transport-level retry and exponential backoff.
///
/// Returns the first successful response, or the last error once retries are
/// exhausted. The caller is expected to continue without this endpoint on
/// failure.
pub async fn with_retry(
    upstream: &Arc<dyn Upstream>,
    request: &UpstreamRequest,
    policy: &RetryPolicy,
    cancel: Option<&AtomicBool>,
) -> Result<UpstreamResponse> {
    let mut last_error: Option<QuorumError> = None;

    for attempt in 0..=policy.max_retries {
        if cancelled(cancel) {
            return Err(QuorumError::Cancelled);
        }

        if attempt > 0 {
            let delay = match &last_error {
                Some(QuorumError::HttpError {
                    retry_after: Some(after),
                    ..
                }) if policy.respect_retry_after => *after,
                _ => policy.delay_for_attempt(attempt - 1),
            };
            tracing::warn!(
                model = %request.model,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %last_error.as_ref().map(ToString::to_string).unwrap_or_default(),
                "retrying upstream call"
            );
            tokio::time::sleep(delay).await;
            if cancelled(cancel) {
                return Err(QuorumError::Cancelled);
            }
        }

        match upstream.complete(request).await {
            Ok(response) => return Ok(response),
            Err(e) => {
                if attempt < policy.max_retries && is_retryable(&e, policy) {
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| QuorumError::Other("retry loop exited unexpectedly".into())))
}

/// Execute a streaming call with transport-level retry.
///
/// Each retry restarts the stream from scratch; tokens from failed attempts
/// have already been surfaced to `on_token` and it is the caller's job to
/// discard buffered state between attempts if it needs exactly-once tokens.
pub async fn with_retry_streaming(
    upstream: &Arc<dyn Upstream>,
    request: &UpstreamRequest,
    policy: &RetryPolicy,
    cancel: Option<&AtomicBool>,
    on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
) -> Result<UpstreamResponse> {
    let mut last_error: Option<QuorumError> = None;

    for attempt in 0..=policy.max_retries {
        if cancelled(cancel) {
            return Err(QuorumError::Cancelled);
        }

        if attempt > 0 {
            let delay = match &last_error {
                Some(QuorumError::HttpError {
                    retry_after: Some(after),
                    ..
                }) if policy.respect_retry_after => *after,
                _ => policy.delay_for_attempt(attempt - 1),
            };
            tokio::time::sleep(delay).await;
            if cancelled(cancel) {
                return Err(QuorumError::Cancelled);
            }
        }

        match upstream.complete_streaming(request, on_token).await {
            Ok(response) => return Ok(response),
            Err(e) => {
                if attempt < policy.max_retries && is_retryable(&e, policy) {
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| QuorumError::Other("retry loop exited unexpectedly".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_is_retryable_statuses() {
        let policy = RetryPolicy::default();
        for status in [429u16, 500, 502, 503, 504] {
            let err = QuorumError::HttpError {
                status,
                body: String::new(),
                retry_after: None,
            };
            assert!(is_retryable(&err, &policy), "status {status}");
        }
    }

    #[test]
    fn test_is_retryable_client_error_not_retried() {
        let policy = RetryPolicy::default();
        let err = QuorumError::HttpError {
            status: 400,
            body: "bad request".into(),
            retry_after: None,
        };
        assert!(!is_retryable(&err, &policy));
        assert!(!is_retryable(&QuorumError::Cancelled, &policy));
        assert!(!is_retryable(&QuorumError::Other("x".into()), &policy));
    }

    #[test]
    fn test_message_content_as_text_flattens_parts() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "question".into(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,AAAA".into(),
                },
            },
            ContentPart::Text {
                text: "more".into(),
            },
        ]);
        assert_eq!(content.as_text(), "question\nmore");
    }

    #[test]
    fn test_chat_message_serialization() {
        let msg = ChatMessage::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");

        let parts = ChatMessage::user_parts(vec![ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "data:x".into(),
            },
        }]);
        let json = serde_json::to_value(&parts).unwrap();
        assert_eq!(json["content"][0]["type"], "image_url");
        assert_eq!(json["content"][0]["image_url"]["url"], "data:x");
    }

    #[tokio::test]
    async fn test_with_retry_respects_cancellation() {
        let cancel = AtomicBool::new(true);
        let upstream: Arc<dyn Upstream> = Arc::new(MockUpstream::fixed("unused"));
        let request = UpstreamRequest::simple("m", "prompt");

        let result = with_retry(
            &upstream,
            &request,
            &RetryPolicy::default(),
            Some(&cancel),
        )
        .await;
        assert!(matches!(result, Err(QuorumError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers_after_retryable_failure() {
        let mock = MockUpstream::new();
        mock.script("m", mock::MockReply::HttpFailure(503));
        mock.script("m", mock::MockReply::Text("second try".into()));
        let upstream: Arc<dyn Upstream> = Arc::new(mock);

        let request = UpstreamRequest::simple("m", "prompt");
        let response = with_retry(&upstream, &request, &RetryPolicy::default(), None)
            .await
            .unwrap();
        assert_eq!(response.text, "second try");
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_streaming_restarts_from_scratch() {
        let mock = MockUpstream::new();
        mock.script("m", mock::MockReply::HttpFailure(503));
        mock.script("m", mock::MockReply::Text("streamed out".into()));
        let upstream: Arc<dyn Upstream> = Arc::new(mock);

        let request = UpstreamRequest::simple("m", "prompt");
        let mut tokens = Vec::new();
        let response = with_retry_streaming(
            &upstream,
            &request,
            &RetryPolicy::default(),
            None,
            &mut |t| tokens.push(t.to_string()),
        )
        .await
        .unwrap();
        assert_eq!(response.text, "streamed out");
        assert_eq!(tokens.concat(), "streamed out");
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_on_fatal_status() {
        let mock = MockUpstream::new();
        mock.script("m", mock::MockReply::HttpFailure(400));
        mock.script("m", mock::MockReply::Text("never reached".into()));
        let upstream: Arc<dyn Upstream> = Arc::new(mock);

        let request = UpstreamRequest::simple("m", "prompt");
        let result = with_retry(&upstream, &request, &RetryPolicy::default(), None).await;
        assert!(matches!(
            result,
            Err(QuorumError::HttpError { status: 400, .. })
        ));
    }
}
