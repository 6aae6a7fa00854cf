//! Mock upstream for testing without a live endpoint service.
//!
//! [`MockUpstream`] scripts replies per endpoint identifier and records every
//! request it sees, so scheduler and dispatcher paths can assert on both the
//! prompts sent and the failure handling.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Upstream, UpstreamRequest, UpstreamResponse};
use crate::error::{QuorumError, Result};

/// A scripted reply for one call to one endpoint.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Succeed with this text.
    Text(String),
    /// Fail with `HTTP {status}`.
    HttpFailure(u16),
}

/// Test double that returns scripted replies per endpoint, in order.
///
/// When an endpoint's script runs out, the default reply is used; with no
/// default configured the call fails. Streaming calls emit the reply in small
/// chunks so prefix-buffering consumers see multiple tokens.
#[derive(Debug, Default)]
pub struct MockUpstream {
    scripts: Mutex<HashMap<String, VecDeque<MockReply>>>,
    default_reply: Option<String>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockUpstream {
    /// A mock with no scripts and no default; every call must be scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that answers every call from every endpoint with `text`.
    pub fn fixed(text: impl Into<String>) -> Self {
        Self {
            default_reply: Some(text.into()),
            ..Self::default()
        }
    }

    /// Set the reply used when an endpoint's script is exhausted.
    pub fn with_default(mut self, text: impl Into<String>) -> Self {
        self.default_reply = Some(text.into());
        self
    }

    /// Queue a reply for the given endpoint.
    pub fn script(&self, model: &str, reply: MockReply) {
        self.scripts
            .lock()
            .expect("mock scripts lock poisoned")
            .entry(model.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Queue a successful text reply for the given endpoint.
    pub fn script_text(&self, model: &str, text: impl Into<String>) {
        self.script(model, MockReply::Text(text.into()));
    }

    /// All `(model, flattened prompt)` pairs seen so far, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().expect("mock calls lock poisoned").clone()
    }

    fn next_reply(&self, request: &UpstreamRequest) -> Result<String> {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.as_text())
            .unwrap_or_default();
        self.calls
            .lock()
            .expect("mock calls lock poisoned")
            .push((request.model.clone(), prompt));

        let scripted = self
            .scripts
            .lock()
            .expect("mock scripts lock poisoned")
            .get_mut(&request.model)
            .and_then(VecDeque::pop_front);

        match scripted {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::HttpFailure(status)) => Err(QuorumError::HttpError {
                status,
                body: "mock failure".into(),
                retry_after: None,
            }),
            None => match &self.default_reply {
                Some(text) => Ok(text.clone()),
                None => Err(QuorumError::Other(format!(
                    "no scripted reply for {}",
                    request.model
                ))),
            },
        }
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn complete(&self, request: &UpstreamRequest) -> Result<UpstreamResponse> {
        let text = self.next_reply(request)?;
        Ok(UpstreamResponse {
            text,
            status: 200,
            metadata: None,
        })
    }

    async fn complete_streaming(
        &self,
        request: &UpstreamRequest,
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<UpstreamResponse> {
        let text = self.next_reply(request)?;
        // Emit in small chunks so buffer-based consumers exercise real paths.
        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(7) {
            let piece: String = chunk.iter().collect();
            on_token(&piece);
        }
        Ok(UpstreamResponse {
            text,
            status: 200,
            metadata: None,
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
