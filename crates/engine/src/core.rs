//! Engine Facade
//!
//! Ties the cache, selector/dispatcher, and internal store together behind
//! one `fetch` entry point. Internal reads short-circuit to the period
//! store; external reads coalesce through the cache and fail over through
//! the dispatcher.

use crate::cache::{CoalescingCache, Lookup};
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::period_store::PeriodStore;
use crate::registry::UpstreamRegistry;
use crate::request::{DataRequest, RequestKind};
use std::sync::Arc;

/// Shared handle to the orchestration core.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<UpstreamRegistry>,
    cache: Arc<CoalescingCache>,
    dispatcher: Dispatcher,
    period_store: Option<Arc<PeriodStore>>,
}

impl Engine {
    #[must_use]
    pub fn new(
        registry: Arc<UpstreamRegistry>,
        cache: Arc<CoalescingCache>,
        dispatcher: Dispatcher,
        period_store: Option<Arc<PeriodStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cache,
            dispatcher,
            period_store,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<UpstreamRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CoalescingCache> {
        &self.cache
    }

    #[must_use]
    pub fn period_store(&self) -> Option<&Arc<PeriodStore>> {
        self.period_store.as_ref()
    }

    /// Resolve one data request: internal route, cache hit, join, or a led
    /// dispatch whose result every joiner shares.
    ///
    /// Upstream attempts run on detached tasks: a caller dropped mid-flight
    /// (deadline, client gone) discards the result, but the attempt itself
    /// runs to completion, keeps the registry accounting balanced, and
    /// still completes the cache entry for every joiner.
    pub async fn fetch(&self, dr: &DataRequest) -> Result<Vec<u8>, GatewayError> {
        if dr.kind == RequestKind::Internal {
            let store = self.period_store.as_ref().ok_or_else(|| {
                GatewayError::ResourceExhausted("no period store configured".into())
            })?;
            return store.handle_internal(&dr.path).await;
        }

        match self.cache.lookup(dr) {
            Lookup::Hit(bytes) => Ok(bytes),
            Lookup::Bypass => {
                let dispatcher = self.dispatcher.clone();
                let dr = dr.clone();
                await_detached(tokio::spawn(async move { dispatcher.fetch(&dr).await })).await
            }
            Lookup::Join(mut rx) => match rx.recv().await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Fatal("cache broadcast closed".into())),
            },
            Lookup::Lead(guard) => {
                let dispatcher = self.dispatcher.clone();
                let ttl = self.cache.ttl_for(dr);
                let dr = dr.clone();
                await_detached(tokio::spawn(async move {
                    let result = dispatcher.fetch(&dr).await;
                    guard.complete(result.clone(), ttl);
                    result
                }))
                .await
            }
        }
    }
}

async fn await_detached(
    task: tokio::task::JoinHandle<Result<Vec<u8>, GatewayError>>,
) -> Result<Vec<u8>, GatewayError> {
    match task.await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Fatal("dispatch task failed".into())),
    }
}
