//! Shared Application State
//!
//! Handle bundle the HTTP handlers work against: the engine, the proof
//! runner, the envelope verifier, live status feeds from the event
//! consumer, and the shutdown/restart plumbing.

use crate::config::Args;
use gateway_engine::{ConsumerState, Engine, HeadSnapshot, ProofRunner};
use gateway_proofs::EnvelopeVerifier;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    engine: Arc<Engine>,
    runner: ProofRunner,
    verifier: Arc<dyn EnvelopeVerifier>,
    args: RwLock<Args>,
    start_time: Instant,
    consumer_state: Option<watch::Receiver<ConsumerState>>,
    head: Option<watch::Receiver<Option<HeadSnapshot>>>,
    prometheus: Option<PrometheusHandle>,
    shutdown_tx: watch::Sender<bool>,
    restart_requested: AtomicBool,
}

impl AppState {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<Engine>,
        runner: ProofRunner,
        verifier: Arc<dyn EnvelopeVerifier>,
        args: Args,
        consumer_state: Option<watch::Receiver<ConsumerState>>,
        head: Option<watch::Receiver<Option<HeadSnapshot>>>,
        prometheus: Option<PrometheusHandle>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                engine,
                runner,
                verifier,
                args: RwLock::new(args),
                start_time: Instant::now(),
                consumer_state,
                head,
                prometheus,
                shutdown_tx,
                restart_requested: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.inner.engine
    }

    #[must_use]
    pub fn runner(&self) -> &ProofRunner {
        &self.inner.runner
    }

    #[must_use]
    pub fn verifier(&self) -> &dyn EnvelopeVerifier {
        self.inner.verifier.as_ref()
    }

    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.inner.args.read().chain_id
    }

    #[must_use]
    pub fn request_deadline(&self) -> std::time::Duration {
        self.inner.args.read().request_deadline()
    }

    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    #[must_use]
    pub fn consumer_state(&self) -> Option<ConsumerState> {
        self.inner.consumer_state.as_ref().map(|rx| *rx.borrow())
    }

    #[must_use]
    pub fn head_snapshot(&self) -> Option<HeadSnapshot> {
        self.inner.head.as_ref().and_then(|rx| rx.borrow().clone())
    }

    #[must_use]
    pub fn prometheus(&self) -> Option<&PrometheusHandle> {
        self.inner.prometheus.as_ref()
    }

    #[must_use]
    pub fn config_snapshot(&self) -> serde_json::Value {
        self.inner.args.read().snapshot()
    }

    /// Apply a config POST.
    ///
    /// # Errors
    /// Propagates validation failures from [`Args::apply_overrides`].
    pub fn apply_config(&self, body: &serde_json::Value) -> Result<Vec<String>, String> {
        self.inner.args.write().apply_overrides(body)
    }

    /// Ask the main loop to re-initialize with the current config.
    pub fn request_restart(&self) {
        self.inner.restart_requested.store(true, Ordering::Relaxed);
        self.inner.shutdown_tx.send_replace(true);
    }

    #[must_use]
    pub fn restart_requested(&self) -> bool {
        self.inner.restart_requested.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_args(&self) -> Args {
        self.inner.args.read().clone()
    }
}
