//! Core context threaded through the pipeline.
//!
//! Process-wide state is explicit: the HTTP-backed upstream client (with its
//! shared connection pool), the transcript store, the credit ledger, and the
//! configuration live in one [`QuorumCtx`] constructed at startup.

use std::sync::Arc;

use crate::config::QuorumConfig;
use crate::error::Result;
use crate::ledger::CreditLedger;
use crate::store::TranscriptStore;
use crate::upstream::{OpenRouterUpstream, RetryPolicy, Upstream};

/// Shared core context. Construct once, wrap in [`Arc`], thread everywhere.
pub struct QuorumCtx {
    pub config: QuorumConfig,
    pub upstream: Arc<dyn Upstream>,
    pub retry: RetryPolicy,
    pub store: TranscriptStore,
    pub ledger: CreditLedger,
}

impl QuorumCtx {
    /// Production wiring: live upstream client plus a store at `db_path`.
    /// Runs the startup cleanup pass before returning.
    pub async fn open(config: QuorumConfig, db_path: &str) -> Result<Arc<Self>> {
        let upstream: Arc<dyn Upstream> = Arc::new(OpenRouterUpstream::new(
            config.api_url.clone(),
            config.api_key.clone(),
        )?);
        let store = TranscriptStore::open(db_path).await?;
        store.startup_cleanup().await?;
        let ledger = store.ledger();
        Ok(Arc::new(Self {
            config,
            upstream,
            retry: RetryPolicy::default(),
            store,
            ledger,
        }))
    }

    /// Custom wiring, used by tests and embedders with their own upstream.
    pub fn with_parts(
        config: QuorumConfig,
        upstream: Arc<dyn Upstream>,
        retry: RetryPolicy,
        store: TranscriptStore,
    ) -> Arc<Self> {
        let ledger = store.ledger();
        Arc::new(Self {
            config,
            upstream,
            retry,
            store,
            ledger,
        })
    }
}

impl std::fmt::Debug for QuorumCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuorumCtx")
            .field("api_url", &self.config.api_url)
            .field("upstream", &self.upstream.name())
            .field("retry", &self.retry)
            .finish()
    }
}
