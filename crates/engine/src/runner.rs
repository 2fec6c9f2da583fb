//! Proof Builder Runner
//!
//! Drives an opaque proof program as a three-valued state machine. Each
//! pass: check cancellation and the deadline, step the program, then either
//! finish or resolve every newly registered read concurrently and resume.
//! A program that stays pending without registering new reads enters
//! retry-or-fatal: failed retryable reads are re-armed a bounded number of
//! times, anything else surfaces.

use crate::context::ProofContext;
use crate::core::Engine;
use crate::error::GatewayError;
use crate::sync::SyncTransitionRunner;
use futures::future::join_all;
use std::sync::Arc;

/// Result of one proof-program step.
#[derive(Debug)]
pub enum StepOutcome {
    /// Terminal: the response body to hand to the client.
    Success(Vec<u8>),
    /// Terminal failure.
    Error(GatewayError),
    /// More reads are needed; the context holds them.
    Pending,
}

/// The opaque proof state function. Implementations register reads through
/// [`ProofContext::require`] and must tolerate replays of completed steps.
pub trait ProofProgram: Send {
    fn step(&mut self, ctx: &mut ProofContext) -> StepOutcome;

    /// Programs with expensive assembly stages run their steps on the
    /// blocking pool.
    fn cpu_heavy(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn ProofProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn ProofProgram").finish_non_exhaustive()
    }
}

/// Runner tuning knobs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How many times a failed read may be re-dispatched by retry-or-fatal.
    pub max_rearms: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { max_rearms: 2 }
    }
}

/// Executes proof programs against the engine.
#[derive(Clone)]
pub struct ProofRunner {
    engine: Arc<Engine>,
    sync: Option<Arc<SyncTransitionRunner>>,
    config: RunnerConfig,
}

impl ProofRunner {
    #[must_use]
    pub fn new(
        engine: Arc<Engine>,
        sync: Option<Arc<SyncTransitionRunner>>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            engine,
            sync,
            config,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run a program to completion.
    ///
    /// # Errors
    /// Terminal program errors, exhausted retries, cancellation, and the
    /// request deadline all surface here.
    #[tracing::instrument(skip_all, fields(method = %ctx.method, trace = ctx.trace_id))]
    pub async fn run(
        &self,
        program: &mut dyn ProofProgram,
        ctx: &mut ProofContext,
    ) -> Result<Vec<u8>, GatewayError> {
        loop {
            if ctx.is_cancelled() {
                ctx.set_error(GatewayError::ClientGone);
                return Err(GatewayError::ClientGone);
            }
            if ctx.deadline_exceeded() {
                let err = GatewayError::Transport("request deadline exceeded".into());
                ctx.set_error(err.clone());
                return Err(err);
            }

            let outcome = if program.cpu_heavy() {
                tokio::task::block_in_place(|| program.step(ctx))
            } else {
                program.step(ctx)
            };

            match outcome {
                StepOutcome::Success(body) => {
                    metrics::counter!("gateway_proofs_total", "outcome" => "success").increment(1);
                    return Ok(body);
                }
                StepOutcome::Error(GatewayError::SyncTransitionRequired { from, to }) => {
                    // not terminal: catch up the committee store and resume
                    let sync = self.sync.as_ref().ok_or_else(|| {
                        GatewayError::Fatal("sync transition required but no runner wired".into())
                    })?;
                    sync.advance(from, to).await?;
                    tokio::task::yield_now().await;
                }
                StepOutcome::Error(err) => {
                    metrics::counter!("gateway_proofs_total", "outcome" => "error").increment(1);
                    ctx.set_error(err.clone());
                    return Err(err);
                }
                StepOutcome::Pending => {
                    if let Some((from, to)) = ctx.take_sync_transition() {
                        let sync = self.sync.as_ref().ok_or_else(|| {
                            GatewayError::Fatal("sync transition required but no runner wired".into())
                        })?;
                        sync.advance(from, to).await?;
                        continue;
                    }

                    let mut batch = ctx.take_pending();
                    if batch.is_empty() {
                        // Pending without new reads: re-arm what can be
                        // retried, otherwise surface the failure.
                        let retryable = ctx.retryable_failures(self.config.max_rearms);
                        if retryable.is_empty() {
                            let err = ctx.first_failure().unwrap_or_else(|| {
                                GatewayError::Fatal("proof program made no progress".into())
                            });
                            ctx.set_error(err.clone());
                            return Err(err);
                        }
                        for fp in retryable {
                            ctx.rearm(fp);
                        }
                        batch = ctx.take_pending();
                    }

                    let deadline = ctx.deadline();
                    let fetches = batch.iter().map(|dr| self.engine.fetch(dr));
                    let results =
                        match tokio::time::timeout_at(deadline.into(), join_all(fetches)).await {
                            Ok(results) => results,
                            Err(_) => {
                                let err =
                                    GatewayError::Transport("request deadline exceeded".into());
                                ctx.set_error(err.clone());
                                return Err(err);
                            }
                        };
                    for (dr, result) in batch.iter().zip(results) {
                        ctx.store_result(dr.fingerprint(), result);
                    }

                    // fairness: give other request frames a turn between passes
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CoalescingCache};
    use crate::context::CancelToken;
    use crate::dispatch::{DispatchConfig, Dispatcher};
    use crate::registry::{RegistryConfig, Upstream, UpstreamRegistry};
    use crate::request::DataRequest;
    use serde_json::{json, Value};
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn runner_for(server_uri: Option<String>) -> ProofRunner {
        let config = RegistryConfig::default();
        let pool = server_uri
            .into_iter()
            .map(|u| Upstream::new(u, 0, &config))
            .collect();
        let registry = Arc::new(UpstreamRegistry::new(config, pool, Vec::new(), Vec::new()));
        let dispatcher = Dispatcher::new(Arc::clone(&registry), DispatchConfig::default()).unwrap();
        let engine = Engine::new(
            registry,
            CoalescingCache::new(CacheConfig::default()),
            dispatcher,
            None,
        );
        ProofRunner::new(engine, None, RunnerConfig::default())
    }

    fn ctx() -> ProofContext {
        ProofContext::new(
            "eth_getBalance",
            json!(["0x00", "0x1"]),
            1,
            Duration::from_secs(30),
            CancelToken::new(),
        )
    }

    /// Requires one balance read, then echoes its result.
    struct BalanceEcho {
        steps: u32,
    }

    impl ProofProgram for BalanceEcho {
        fn step(&mut self, ctx: &mut ProofContext) -> StepOutcome {
            self.steps += 1;
            let dr = DataRequest::eth_rpc("eth_getBalance", &json!(["0x00", "0x1"]));
            match ctx.require(&dr) {
                None => StepOutcome::Pending,
                Some(Ok(body)) => {
                    let value: Value = serde_json::from_slice(&body).unwrap();
                    StepOutcome::Success(value["result"].as_str().unwrap().as_bytes().to_vec())
                }
                Some(Err(e)) => StepOutcome::Error(e),
            }
        }
    }

    #[tokio::test]
    async fn pending_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"jsonrpc":"2.0","id":1,"result":"0x0a"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let runner = runner_for(Some(server.uri()));
        let mut program = BalanceEcho { steps: 0 };
        let mut ctx = ctx();
        let body = runner.run(&mut program, &mut ctx).await.unwrap();
        assert_eq!(body, b"0x0a");
        assert_eq!(program.steps, 2);
    }

    /// Stays pending forever without registering anything new after its
    /// read fails — exercises retry-or-fatal.
    struct StubbornProgram;

    impl ProofProgram for StubbornProgram {
        fn step(&mut self, ctx: &mut ProofContext) -> StepOutcome {
            let dr = DataRequest::eth_rpc("eth_getBalance", &json!(["0x00", "0x1"]));
            match ctx.require(&dr) {
                Some(Ok(body)) => StepOutcome::Success(body),
                _ => StepOutcome::Pending,
            }
        }
    }

    #[tokio::test]
    async fn retry_or_fatal_rearms_then_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            // initial attempt + two re-arms
            .expect(3)
            .mount(&server)
            .await;

        let runner = runner_for(Some(server.uri()));
        let mut ctx = ctx();
        let err = runner.run(&mut StubbornProgram, &mut ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamServer { status: 503, .. }));
        assert!(ctx.error().is_some());
    }

    #[tokio::test]
    async fn retry_or_fatal_recovers_on_second_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let runner = runner_for(Some(server.uri()));
        let mut ctx = ctx();
        let body = runner.run(&mut StubbornProgram, &mut ctx).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["result"], "0x1");
    }

    struct ImmediateSuccess;

    impl ProofProgram for ImmediateSuccess {
        fn step(&mut self, _ctx: &mut ProofContext) -> StepOutcome {
            StepOutcome::Success(b"done".to_vec())
        }
    }

    #[tokio::test]
    async fn cancelled_context_never_steps() {
        let runner = runner_for(None);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut ctx = ProofContext::new(
            "m",
            Value::Null,
            1,
            Duration::from_secs(30),
            cancel,
        );
        let err = runner.run(&mut ImmediateSuccess, &mut ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::ClientGone));
    }

    #[tokio::test]
    async fn deadline_surfaces_as_retryable() {
        let runner = runner_for(None);
        let mut ctx = ProofContext::new(
            "m",
            Value::Null,
            1,
            Duration::ZERO,
            CancelToken::new(),
        );
        let err = runner.run(&mut ImmediateSuccess, &mut ctx).await.unwrap_err();
        assert!(err.is_retryable());
    }

    /// Two reads registered in one pass must fetch concurrently.
    struct TwoReads;

    impl ProofProgram for TwoReads {
        fn step(&mut self, ctx: &mut ProofContext) -> StepOutcome {
            let a = ctx.require(&DataRequest::eth_rpc("eth_getBalance", &json!(["0x01", "0x1"])));
            let b = ctx.require(&DataRequest::eth_rpc("eth_getBalance", &json!(["0x02", "0x1"])));
            match (a, b) {
                (Some(Ok(_)), Some(Ok(_))) => StepOutcome::Success(b"both".to_vec()),
                (Some(Err(e)), _) | (_, Some(Err(e))) => StepOutcome::Error(e),
                _ => StepOutcome::Pending,
            }
        }
    }

    #[tokio::test]
    async fn fan_out_reads_resolve_in_one_pass() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#)
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(2)
            .mount(&server)
            .await;

        let runner = runner_for(Some(server.uri()));
        let mut ctx = ctx();
        let started = std::time::Instant::now();
        let body = runner.run(&mut TwoReads, &mut ctx).await.unwrap();
        assert_eq!(body, b"both");
        // both delayed reads in flight together, not back to back
        assert!(started.elapsed() < Duration::from_millis(190));
    }
}
