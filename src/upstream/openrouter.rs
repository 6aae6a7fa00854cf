//! Upstream client for OpenAI-compatible chat-completions APIs.
//!
//! Endpoint contract: POST `{"model", "messages", "stream"?}` with bearer
//! authorization. Unary responses carry `choices[0].message.content`;
//! streaming responses are SSE delta frames terminated by `data: [DONE]`.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use super::sse::SseDecoder;
use super::{Upstream, UpstreamRequest, UpstreamResponse};
use crate::error::{QuorumError, Result};

/// Per-call timeout for upstream requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Connect timeout for upstream requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Keepalive connections retained per host.
const POOL_MAX_IDLE_PER_HOST: usize = 20;

/// Client for any OpenAI-compatible chat-completions API.
///
/// Holds the process-wide HTTP connection pool; construct once and share as
/// `Arc<dyn Upstream>`. The pool is released when the last clone drops.
#[derive(Clone)]
pub struct OpenRouterUpstream {
    client: Client,
    api_url: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for OpenRouterUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterUpstream")
            .field("api_url", &self.api_url)
            .field(
                "api_key",
                &self.api_key.as_ref().map(|k| {
                    if k.len() > 6 {
                        format!("{}***", &k[..6])
                    } else {
                        "***".to_string()
                    }
                }),
            )
            .finish()
    }
}

impl OpenRouterUpstream {
    /// Create a client with the shared connection pool and standard timeouts.
    pub fn new(api_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key,
        })
    }

    /// Use a pre-built HTTP client (its own timeouts apply).
    pub fn with_client(client: Client, api_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            api_key,
        }
    }

    /// Build the request body.
    fn build_body(request: &UpstreamRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
        });
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    /// Parse a `Retry-After` header value as whole seconds.
    fn parse_retry_after(value: &str) -> Option<Duration> {
        value.trim().parse::<u64>().ok().map(Duration::from_secs)
    }

    fn build_http_request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self.client.post(&self.api_url).json(body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        req
    }

    /// Convert a non-success response into a typed error.
    async fn error_from_response(resp: reqwest::Response) -> QuorumError {
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse_retry_after);
        let body = resp.text().await.unwrap_or_default();
        QuorumError::HttpError {
            status,
            body,
            retry_after,
        }
    }

    /// Extract auxiliary details worth keeping from a unary response.
    fn extract_metadata(json_resp: &Value) -> Option<Value> {
        let mut meta = serde_json::Map::new();
        if let Some(v) = json_resp.get("usage") {
            meta.insert("usage".into(), v.clone());
        }
        if let Some(v) = json_resp.get("model") {
            meta.insert("model".into(), v.clone());
        }
        if let Some(v) = json_resp
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("reasoning_details"))
        {
            meta.insert("reasoning_details".into(), v.clone());
        }
        if meta.is_empty() {
            None
        } else {
            Some(Value::Object(meta))
        }
    }
}

#[async_trait]
impl Upstream for OpenRouterUpstream {
    async fn complete(&self, request: &UpstreamRequest) -> Result<UpstreamResponse> {
        let body = Self::build_body(request, false);
        let resp = self.build_http_request(&body).send().await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }

        let json_resp: Value = resp.json().await?;
        let text = json_resp
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        Ok(UpstreamResponse {
            text,
            status,
            metadata: Self::extract_metadata(&json_resp),
        })
    }

    async fn complete_streaming(
        &self,
        request: &UpstreamRequest,
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<UpstreamResponse> {
        let body = Self::build_body(request, true);
        let resp = self.build_http_request(&body).send().await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }

        let mut stream = resp.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut accumulated = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(QuorumError::Request)?;
            for delta in decoder.push(&chunk) {
                accumulated.push_str(&delta);
                on_token(&delta);
            }
            if decoder.is_done() {
                break;
            }
        }
        for delta in decoder.finish() {
            accumulated.push_str(&delta);
            on_token(&delta);
        }

        Ok(UpstreamResponse {
            text: accumulated,
            status,
            metadata: None,
        })
    }

    fn name(&self) -> &'static str {
        "openrouter"
    }
}
