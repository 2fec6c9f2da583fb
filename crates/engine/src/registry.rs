//! Upstream Registry
//!
//! Tracks every configured upstream's health, latency, concurrency window,
//! and per-method support. Pools are immutable after construction; indices
//! are stable and used in per-request exclude bitmasks. All mutation happens
//! through short non-awaiting critical sections on a per-upstream mutex.

use crate::classify::ResponseClass;
use crate::request::RequestKind;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Upstream pool identifier. REST and prover gateways share one pool,
/// distinguished by capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamKind {
    EthRpc,
    BeaconApi,
    Rest,
}

impl UpstreamKind {
    /// Pool serving a given external request kind. Internal reads have none.
    #[must_use]
    pub fn for_request(kind: RequestKind) -> Option<Self> {
        match kind {
            RequestKind::EthRpc => Some(Self::EthRpc),
            RequestKind::BeaconApi => Some(Self::BeaconApi),
            RequestKind::RestApi => Some(Self::Rest),
            RequestKind::Internal => None,
        }
    }

    const ALL: [Self; 3] = [Self::EthRpc, Self::BeaconApi, Self::Rest];

    fn slot(self) -> usize {
        match self {
            Self::EthRpc => 0,
            Self::BeaconApi => 1,
            Self::Rest => 2,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EthRpc => "eth_rpc",
            Self::BeaconApi => "beacon",
            Self::Rest => "rest",
        }
    }
}

/// Registry tuning knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_concurrency_default: u32,
    pub max_concurrency_cap: u32,
    pub min_concurrency: u32,
    /// Latency below which a successful attempt argues for a wider window.
    pub latency_target_ms: u64,
    /// Minimum spacing between additive window increases.
    pub conc_cooldown: Duration,
    /// Extra slots available past `max_concurrency` once saturation waiting
    /// has been exhausted.
    pub overflow_slots: u32,
    /// Consecutive failures before an upstream is marked unhealthy.
    pub unhealthy_after: u32,
    /// Minimum spacing between recovery probes on an unhealthy upstream.
    pub recovery_cooldown: Duration,
    /// How long a rate-limit signal keeps penalizing selection.
    pub rate_limit_window: Duration,
    /// Head observations older than this make an upstream "stale" for
    /// freshness scoring.
    pub stale_head_after: Duration,
    /// When the healthy fraction of a pool drops below this, the whole pool
    /// is reset to healthy to avoid a recovery storm.
    pub healthy_ratio_floor: f64,
    /// EWMA smoothing factor for latency tracking.
    pub latency_ewma_alpha: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_concurrency_default: 16,
            max_concurrency_cap: 128,
            min_concurrency: 2,
            latency_target_ms: 500,
            conc_cooldown: Duration::from_millis(2_000),
            overflow_slots: 2,
            unhealthy_after: 5,
            recovery_cooldown: Duration::from_secs(60),
            rate_limit_window: Duration::from_secs(15),
            stale_head_after: Duration::from_secs(30),
            healthy_ratio_floor: 0.34,
            latency_ewma_alpha: 0.2,
        }
    }
}

/// Per-method bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct MethodStats {
    pub supported: bool,
    pub latency_ms: Option<f64>,
}

/// Mutable health block of one upstream.
#[derive(Debug)]
pub struct UpstreamHealth {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_timeouts: u32,
    pub successful_requests: u64,
    pub total_requests: u64,
    pub total_response_time_ms: u64,
    pub latency_ms: Option<f64>,
    pub inflight: u32,
    pub max_concurrency: u32,
    pub min_concurrency: u32,
    pub last_adjust: Option<Instant>,
    pub rate_limited_at: Option<Instant>,
    pub latest_block: u64,
    pub head_last_seen: Option<Instant>,
    pub marked_unhealthy_at: Option<Instant>,
    pub last_recovery_at: Option<Instant>,
    pub methods: HashMap<String, MethodStats>,
}

impl UpstreamHealth {
    fn new(config: &RegistryConfig) -> Self {
        Self {
            is_healthy: true,
            consecutive_failures: 0,
            consecutive_timeouts: 0,
            successful_requests: 0,
            total_requests: 0,
            total_response_time_ms: 0,
            latency_ms: None,
            inflight: 0,
            max_concurrency: config.max_concurrency_default,
            min_concurrency: config.min_concurrency,
            last_adjust: None,
            rate_limited_at: None,
            latest_block: 0,
            head_last_seen: None,
            marked_unhealthy_at: None,
            last_recovery_at: None,
            methods: HashMap::new(),
        }
    }

    /// Whether a rate-limit signal is still fresh.
    #[must_use]
    pub fn rate_limited_recent(&self, window: Duration, now: Instant) -> bool {
        self.rate_limited_at
            .is_some_and(|at| now.duration_since(at) < window)
    }

    fn halve_concurrency(&mut self) {
        self.max_concurrency = (self.max_concurrency / 2).max(self.min_concurrency);
    }
}

/// One configured upstream. URL and flags are immutable.
#[derive(Debug)]
pub struct Upstream {
    pub url: String,
    pub flags: u8,
    state: Mutex<UpstreamHealth>,
}

impl Upstream {
    #[must_use]
    pub fn new(url: impl Into<String>, flags: u8, config: &RegistryConfig) -> Self {
        Self {
            url: url.into(),
            flags,
            state: Mutex::new(UpstreamHealth::new(config)),
        }
    }

    /// Run `f` under the health lock. Callers must not await inside.
    pub fn with_state<T>(&self, f: impl FnOnce(&mut UpstreamHealth) -> T) -> T {
        f(&mut self.state.lock())
    }
}

/// Serializable health snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamSnapshot {
    pub url: String,
    pub kind: &'static str,
    pub healthy: bool,
    pub inflight: u32,
    pub max_concurrency: u32,
    pub latency_ms: Option<f64>,
    pub successful_requests: u64,
    pub total_requests: u64,
    pub latest_block: u64,
    pub rate_limited: bool,
}

/// Immutable pools of upstreams plus the shared tuning config.
#[derive(Debug)]
pub struct UpstreamRegistry {
    config: RegistryConfig,
    pools: [Vec<Upstream>; 3],
    /// Round-robin cursors for selection tie-breaking, one per pool.
    cursors: [AtomicUsize; 3],
}

impl UpstreamRegistry {
    #[must_use]
    pub fn new(
        config: RegistryConfig,
        eth_rpc: Vec<Upstream>,
        beacon: Vec<Upstream>,
        rest: Vec<Upstream>,
    ) -> Self {
        Self {
            config,
            pools: [eth_rpc, beacon, rest],
            cursors: [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    #[must_use]
    pub fn pool(&self, kind: UpstreamKind) -> &[Upstream] {
        &self.pools[kind.slot()]
    }

    /// Advance and fetch the round-robin cursor for a pool.
    pub(crate) fn next_cursor(&self, kind: UpstreamKind) -> usize {
        self.cursors[kind.slot()].fetch_add(1, Ordering::Relaxed)
    }

    /// Reserve an attempt slot. Returns false when the upstream is saturated
    /// (or unhealthy with its recovery allowance spent), in which case no
    /// counters change.
    pub fn on_attempt_start(&self, kind: UpstreamKind, idx: usize, allow_overflow: bool) -> bool {
        let Some(upstream) = self.pool(kind).get(idx) else {
            return false;
        };
        let now = Instant::now();
        upstream.with_state(|s| {
            if !s.is_healthy {
                let anchor = s.last_recovery_at.or(s.marked_unhealthy_at);
                let due = anchor
                    .is_none_or(|at| now.duration_since(at) >= self.config.recovery_cooldown);
                if !due {
                    return false;
                }
                s.last_recovery_at = Some(now);
            }
            let limit = if allow_overflow {
                s.max_concurrency + self.config.overflow_slots
            } else {
                s.max_concurrency
            };
            if s.inflight >= limit {
                return false;
            }
            s.inflight += 1;
            s.total_requests += 1;
            true
        })
    }

    /// Record the outcome of an attempt started via [`Self::on_attempt_start`].
    pub fn on_attempt_end(
        &self,
        kind: UpstreamKind,
        idx: usize,
        latency: Duration,
        class: ResponseClass,
        http_status: u16,
        method: Option<&str>,
    ) {
        let Some(upstream) = self.pool(kind).get(idx) else {
            return;
        };
        let now = Instant::now();
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        metrics::counter!(
            "gateway_upstream_attempts_total",
            "pool" => kind.as_str(),
            "class" => class_label(class)
        )
        .increment(1);

        upstream.with_state(|s| {
            s.inflight = s.inflight.saturating_sub(1);
            s.total_response_time_ms = s.total_response_time_ms.saturating_add(latency_ms);

            if http_status == 429 {
                s.rate_limited_at = Some(now);
                s.halve_concurrency();
            }

            match class {
                ResponseClass::Success => {
                    s.successful_requests += 1;
                    s.consecutive_failures = 0;
                    s.consecutive_timeouts = 0;
                    if !s.is_healthy {
                        s.is_healthy = true;
                        s.marked_unhealthy_at = None;
                        // A fresh recovery stamp blocks further probes for a
                        // full window if this upstream degrades again.
                        s.last_recovery_at = Some(now);
                    }
                    update_ewma(&mut s.latency_ms, latency_ms, self.config.latency_ewma_alpha);
                    if let Some(m) = method {
                        let stats = s.methods.entry(m.to_string()).or_insert(MethodStats {
                            supported: true,
                            latency_ms: None,
                        });
                        stats.supported = true;
                        update_ewma(&mut stats.latency_ms, latency_ms, self.config.latency_ewma_alpha);
                    }
                    let under_target = latency_ms < self.config.latency_target_ms;
                    let rate_limited = s.rate_limited_recent(self.config.rate_limit_window, now);
                    let cooled = s
                        .last_adjust
                        .is_none_or(|at| now.duration_since(at) >= self.config.conc_cooldown);
                    if under_target && !rate_limited && cooled {
                        s.max_concurrency =
                            (s.max_concurrency + 1).min(self.config.max_concurrency_cap);
                        s.last_adjust = Some(now);
                    }
                }
                ResponseClass::Retry => {
                    s.consecutive_failures += 1;
                    if http_status == crate::classify::STATUS_TRANSPORT {
                        s.consecutive_timeouts += 1;
                        if s.consecutive_timeouts >= 2 {
                            s.halve_concurrency();
                            s.consecutive_timeouts = 0;
                        }
                    } else {
                        s.consecutive_timeouts = 0;
                    }
                    if s.is_healthy && s.consecutive_failures >= self.config.unhealthy_after {
                        s.is_healthy = false;
                        s.marked_unhealthy_at = Some(now);
                    }
                }
                // The upstream answered; the request was at fault or the
                // value is absent. Neither moves health.
                ResponseClass::UserError
                | ResponseClass::NotFound
                | ResponseClass::MethodNotSupported => {
                    s.consecutive_timeouts = 0;
                }
            }
        });
    }

    /// Note a JSON-RPC level rate limit (−32029) that arrived inside a 2xx.
    pub fn note_rate_limited(&self, kind: UpstreamKind, idx: usize) {
        if let Some(upstream) = self.pool(kind).get(idx) {
            upstream.with_state(|s| {
                s.rate_limited_at = Some(Instant::now());
                s.halve_concurrency();
            });
        }
    }

    /// Remember that an upstream cannot serve a method.
    pub fn mark_unsupported(&self, kind: UpstreamKind, idx: usize, method: &str) {
        if let Some(upstream) = self.pool(kind).get(idx) {
            upstream.with_state(|s| {
                s.methods
                    .entry(method.to_string())
                    .or_insert_with(MethodStats::default)
                    .supported = false;
            });
        }
    }

    #[must_use]
    pub fn is_supported(&self, kind: UpstreamKind, idx: usize, method: &str) -> bool {
        self.pool(kind)
            .get(idx)
            .is_none_or(|u| u.with_state(|s| s.methods.get(method).is_none_or(|m| m.supported)))
    }

    /// Record a head observation for freshness scoring.
    pub fn head_observed(&self, kind: UpstreamKind, idx: usize, block: u64) {
        if let Some(upstream) = self.pool(kind).get(idx) {
            upstream.with_state(|s| {
                s.latest_block = s.latest_block.max(block);
                s.head_last_seen = Some(Instant::now());
            });
        }
    }

    /// When most of a pool has been marked unhealthy, marking everything
    /// healthy again beats hammering the survivors.
    pub fn attempt_recovery_sweep(&self) {
        for kind in UpstreamKind::ALL {
            let pool = self.pool(kind);
            if pool.is_empty() {
                continue;
            }
            let healthy = pool
                .iter()
                .filter(|u| u.with_state(|s| s.is_healthy))
                .count();
            #[allow(clippy::cast_precision_loss)]
            let ratio = healthy as f64 / pool.len() as f64;
            if ratio < self.config.healthy_ratio_floor {
                for upstream in pool {
                    upstream.with_state(|s| {
                        s.is_healthy = true;
                        s.consecutive_failures = 0;
                        s.marked_unhealthy_at = None;
                    });
                }
                tracing::warn!(pool = kind.as_str(), "healthy ratio collapsed, resetting pool");
            }
        }
    }

    /// Health snapshots for the status endpoint and metrics export.
    #[must_use]
    pub fn snapshot(&self) -> Vec<UpstreamSnapshot> {
        let now = Instant::now();
        let mut out = Vec::new();
        for kind in UpstreamKind::ALL {
            for upstream in self.pool(kind) {
                out.push(upstream.with_state(|s| UpstreamSnapshot {
                    url: upstream.url.clone(),
                    kind: kind.as_str(),
                    healthy: s.is_healthy,
                    inflight: s.inflight,
                    max_concurrency: s.max_concurrency,
                    latency_ms: s.latency_ms,
                    successful_requests: s.successful_requests,
                    total_requests: s.total_requests,
                    latest_block: s.latest_block,
                    rate_limited: s.rate_limited_recent(self.config.rate_limit_window, now),
                }));
            }
        }
        out
    }
}

fn update_ewma(slot: &mut Option<f64>, sample_ms: u64, alpha: f64) {
    #[allow(clippy::cast_precision_loss)]
    let sample = sample_ms as f64;
    *slot = Some(match *slot {
        Some(current) => current + alpha * (sample - current),
        None => sample,
    });
}

fn class_label(class: ResponseClass) -> &'static str {
    match class {
        ResponseClass::Success => "success",
        ResponseClass::Retry => "retry",
        ResponseClass::UserError => "user_error",
        ResponseClass::MethodNotSupported => "method_not_supported",
        ResponseClass::NotFound => "not_found",
    }
}
