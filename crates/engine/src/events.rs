//! Beacon Event Consumer
//!
//! Long-lived subscriber to the beacon node's `eth/v1/events` stream.
//! Maintains a connect / stream / reconnect state machine with an
//! inactivity timer, parses frames incrementally, and reacts to `head` and
//! `finalized_checkpoint` events: head events prefetch the signed block and
//! publish it into the cache so in-flight proofs observe fresh data without
//! issuing their own reads; finality events drive sync-committee
//! transitions.

use crate::core::Engine;
use crate::registry::UpstreamKind;
use crate::request::{flags, BodyEncoding, DataRequest};
use crate::sse::{SseEvent, SseParser};
use crate::sync::SyncTransitionRunner;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Epochs per sync-committee period.
pub const EPOCHS_PER_PERIOD: u64 = 256;

/// Consumer tuning knobs.
#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Tear the stream down when no bytes arrive for this long.
    pub inactivity: Duration,
    /// Pause between reconnect attempts.
    pub reconnect_wait: Duration,
    pub topics: String,
    /// TTL for head data published into the cache.
    pub head_ttl: Duration,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            inactivity: Duration::from_secs(30),
            reconnect_wait: Duration::from_secs(5),
            topics: "head,finalized_checkpoint".into(),
            head_ttl: Duration::from_secs(12),
        }
    }
}

/// Lifecycle of the consumer, surfaced on the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Streaming,
    ReconnectWait,
}

/// Latest head digest derived from a `head` event and its block fetch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HeadSnapshot {
    pub slot: u64,
    pub block_root: String,
    pub parent_root: String,
    pub execution_block_number: u64,
    pub execution_block_hash: String,
}

enum StreamEnd {
    Shutdown,
    Inactivity,
    Transport(String),
    Eof,
}

/// The SSE consumer task.
pub struct BeaconEventConsumer {
    engine: Arc<Engine>,
    sync: Option<Arc<SyncTransitionRunner>>,
    config: EventsConfig,
    client: reqwest::Client,
    state_tx: watch::Sender<ConsumerState>,
    head_tx: watch::Sender<Option<HeadSnapshot>>,
    attempts: usize,
}

impl BeaconEventConsumer {
    /// Build the consumer plus watch handles for status reporting.
    #[must_use]
    pub fn new(
        engine: Arc<Engine>,
        sync: Option<Arc<SyncTransitionRunner>>,
        config: EventsConfig,
    ) -> (
        Self,
        watch::Receiver<ConsumerState>,
        watch::Receiver<Option<HeadSnapshot>>,
    ) {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Disconnected);
        let (head_tx, head_rx) = watch::channel(None);
        // no total timeout: the subscription is meant to stay open
        let client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        (
            Self {
                engine,
                sync,
                config,
                client,
                state_tx,
                head_tx,
                attempts: 0,
            },
            state_rx,
            head_rx,
        )
    }

    /// Consume until shutdown flips. Reconnects forever on failure.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.state_tx.send_replace(ConsumerState::Connecting);
            match self.stream_once(&mut shutdown).await {
                StreamEnd::Shutdown => break,
                StreamEnd::Inactivity => {
                    tracing::warn!("beacon event stream went quiet, reconnecting");
                }
                StreamEnd::Transport(message) => {
                    tracing::warn!(error = %message, "beacon event stream failed");
                }
                StreamEnd::Eof => {
                    tracing::warn!("beacon event stream closed by upstream");
                }
            }
            self.attempts += 1;
            self.state_tx.send_replace(ConsumerState::ReconnectWait);
            tokio::select! {
                () = tokio::time::sleep(self.config.reconnect_wait) => {}
                _ = shutdown.changed() => {}
            }
        }
        self.state_tx.send_replace(ConsumerState::Disconnected);
    }

    /// Pick the event upstream: flagged publishers first, then anything
    /// event-capable, rotating across reconnect attempts.
    fn event_upstream(&self) -> Option<(usize, String)> {
        let pool = self.engine.registry().pool(UpstreamKind::BeaconApi);
        let mut candidates: Vec<usize> = pool
            .iter()
            .enumerate()
            .filter(|(_, u)| u.flags & flags::BEACON_EVENT_PUBLISHER != 0)
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            candidates = pool
                .iter()
                .enumerate()
                .filter(|(_, u)| u.flags & flags::EVENT_SOURCE != 0)
                .map(|(i, _)| i)
                .collect();
        }
        if candidates.is_empty() {
            candidates = (0..pool.len()).collect();
        }
        if candidates.is_empty() {
            return None;
        }
        let idx = candidates[self.attempts % candidates.len()];
        Some((idx, pool[idx].url.clone()))
    }

    async fn stream_once(&self, shutdown: &mut watch::Receiver<bool>) -> StreamEnd {
        let Some((idx, base)) = self.event_upstream() else {
            return StreamEnd::Transport("no beacon upstream configured".into());
        };
        let url = format!(
            "{}/eth/v1/events?topics={}",
            base.trim_end_matches('/'),
            self.config.topics
        );

        let response = match self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .header(reqwest::header::CONNECTION, "keep-alive")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return StreamEnd::Transport(e.to_string()),
        };
        if !response.status().is_success() {
            return StreamEnd::Transport(format!("event subscription status {}", response.status()));
        }

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut streaming = false;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return StreamEnd::Shutdown;
                    }
                }
                chunk = tokio::time::timeout(self.config.inactivity, stream.next()) => {
                    match chunk {
                        Err(_) => return StreamEnd::Inactivity,
                        Ok(None) => return StreamEnd::Eof,
                        Ok(Some(Err(e))) => return StreamEnd::Transport(e.to_string()),
                        Ok(Some(Ok(bytes))) => {
                            if !streaming {
                                streaming = true;
                                self.state_tx.send_replace(ConsumerState::Streaming);
                            }
                            for event in parser.push(&bytes) {
                                self.handle_event(idx, &event).await;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&self, upstream_idx: usize, event: &SseEvent) {
        match event.event.as_str() {
            "head" => self.on_head(upstream_idx, &event.data),
            "finalized_checkpoint" => self.on_finalized(&event.data).await,
            other => {
                tracing::debug!(event = other, "ignoring beacon event");
            }
        }
    }

    /// Head event: record freshness, then prefetch the signed block in the
    /// background so waiting proofs complete off the cache.
    fn on_head(&self, upstream_idx: usize, data: &str) {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            tracing::warn!("malformed head event payload");
            return;
        };
        let slot = parse_quantity(value.get("slot"));
        let Some(root) = value.get("block").and_then(Value::as_str) else {
            return;
        };
        self.engine
            .registry()
            .head_observed(UpstreamKind::BeaconApi, upstream_idx, slot);
        metrics::counter!("gateway_beacon_events_total", "event" => "head").increment(1);

        let engine = Arc::clone(&self.engine);
        let head_tx = self.head_tx.clone();
        let head_ttl = self.config.head_ttl;
        let root = root.to_string();
        tokio::spawn(async move {
            if let Err(e) = prefetch_head(&engine, &head_tx, &root, slot, head_ttl).await {
                tracing::debug!(error = %e, "head prefetch failed");
            }
        });
    }

    /// Finality event: when the finalized period moved past what the period
    /// store holds, run the committee transition now instead of on the next
    /// proof's critical path.
    async fn on_finalized(&self, data: &str) {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            tracing::warn!("malformed finalized_checkpoint payload");
            return;
        };
        let epoch = parse_quantity(value.get("epoch"));
        let period = epoch / EPOCHS_PER_PERIOD;
        metrics::counter!("gateway_beacon_events_total", "event" => "finalized").increment(1);

        let Some(sync) = &self.sync else {
            return;
        };
        match sync.stored_period().await {
            Ok(Some(stored)) if stored < period => {
                if let Err(e) = sync.advance(stored, period).await {
                    tracing::warn!(error = %e, from = stored, to = period, "sync transition failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "period store unreadable"),
        }
    }
}

/// Fetch the signed head block and publish it under both its root key and
/// the well-known head key, so a proof waiting on `blocks/head` resumes via
/// the cache instead of dispatching its own read.
pub async fn prefetch_head(
    engine: &Arc<Engine>,
    head_tx: &watch::Sender<Option<HeadSnapshot>>,
    root: &str,
    slot: u64,
    head_ttl: Duration,
) -> Result<(), crate::error::GatewayError> {
    let block_dr = DataRequest::beacon_get(&format!("eth/v2/beacon/blocks/{root}"), BodyEncoding::Json);
    let body = engine.fetch(&block_dr).await?;

    let head_dr = DataRequest::beacon_get("eth/v2/beacon/blocks/head", BodyEncoding::Json);
    engine
        .cache()
        .publish(head_dr.fingerprint(), body.clone(), head_ttl);

    let value: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let message = &value["data"]["message"];
    let payload = &message["body"]["execution_payload"];
    let snapshot = HeadSnapshot {
        slot,
        block_root: root.to_string(),
        parent_root: message["parent_root"].as_str().unwrap_or_default().to_string(),
        execution_block_number: parse_quantity(payload.get("block_number")),
        execution_block_hash: payload["block_hash"].as_str().unwrap_or_default().to_string(),
    };

    // warm the parent as well; proofs anchoring to head routinely need it
    let parent = snapshot.parent_root.clone();
    if !parent.is_empty() {
        let engine = Arc::clone(engine);
        tokio::spawn(async move {
            let dr = DataRequest::beacon_get(&format!("eth/v2/beacon/blocks/{parent}"), BodyEncoding::Json);
            let _ = engine.fetch(&dr).await;
        });
    }

    head_tx.send_replace(Some(snapshot));
    Ok(())
}

/// Beacon API numbers arrive as decimal strings.
fn parse_quantity(value: Option<&Value>) -> u64 {
    value
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}
