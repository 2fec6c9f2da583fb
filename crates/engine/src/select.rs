//! Upstream Selection
//!
//! Scores every eligible upstream in a pool and picks the best one. The
//! score favors healthy, fast, uncrowded upstreams, with bonuses for
//! preferred capabilities and fresh head data, and penalties for recent
//! rate limiting. Saturation is reported separately so the dispatcher can
//! wait and then spill into overflow slots on the best candidate.

use crate::registry::{UpstreamKind, UpstreamRegistry};
use std::time::Instant;

/// Result of one selection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Index of the chosen upstream; an inflight slot is still to be
    /// reserved by the caller.
    Chosen(usize),
    /// Every eligible upstream is at its concurrency limit; the payload is
    /// the best candidate to overflow onto after waiting.
    Saturated(usize),
    /// No upstream can serve this request at all.
    None,
}

/// Score and pick an upstream from `kind`'s pool.
///
/// `exclude` is a bitmask over pool indices (bit set = skip), `preferred` a
/// capability mask earning a bonus, `method` the JSON-RPC method for support
/// filtering and per-method latency, `min_block` the freshness requirement.
#[must_use]
pub fn select(
    registry: &UpstreamRegistry,
    kind: UpstreamKind,
    exclude: u64,
    preferred: u8,
    method: Option<&str>,
    min_block: Option<u64>,
) -> SelectOutcome {
    let pool = registry.pool(kind);
    let config = registry.config();
    let now = Instant::now();

    let mut best: Option<(f64, u32, usize)> = None;
    let mut best_any: Option<(f64, usize)> = None;
    let mut saw_saturated_healthy = false;

    for (idx, upstream) in pool.iter().enumerate() {
        if idx < 64 && exclude & (1 << idx) != 0 {
            continue;
        }
        if let Some(m) = method {
            if !registry.is_supported(kind, idx, m) {
                continue;
            }
        }

        let (score, inflight, saturated, healthy) = upstream.with_state(|s| {
            let capacity = f64::from(s.max_concurrency.saturating_sub(s.inflight) + 1)
                / f64::from(s.max_concurrency + 1);

            let ewma = method
                .and_then(|m| s.methods.get(m))
                .and_then(|m| m.latency_ms)
                .or(s.latency_ms);
            let latency = match ewma {
                #[allow(clippy::cast_precision_loss)]
                Some(ms) => (config.latency_target_ms as f64 / ms.max(1.0)).clamp(0.0, 4.0),
                None => 1.0,
            };

            let health = if s.is_healthy { 1.0 } else { 0.1 };
            let kind_bonus = if preferred != 0 && upstream.flags & preferred != 0 {
                1.25
            } else {
                1.0
            };
            let freshness = match min_block {
                Some(block) if s.latest_block >= block => 1.15,
                Some(_) => {
                    let stale = s
                        .head_last_seen
                        .is_none_or(|at| now.duration_since(at) >= config.stale_head_after);
                    if stale {
                        0.5
                    } else {
                        1.0
                    }
                }
                None => 1.0,
            };
            let rl_penalty = if s.rate_limited_recent(config.rate_limit_window, now) {
                0.5
            } else {
                1.0
            };

            (
                health * capacity * latency * kind_bonus * freshness * rl_penalty,
                s.inflight,
                s.inflight >= s.max_concurrency,
                s.is_healthy,
            )
        });

        if best_any.is_none_or(|(s, _)| score > s) {
            best_any = Some((score, idx));
        }
        if saturated {
            saw_saturated_healthy |= healthy;
            continue;
        }

        let better = match best {
            None => true,
            Some((best_score, best_inflight, best_idx)) => {
                if score > best_score {
                    true
                } else if (score - best_score).abs() < f64::EPSILON {
                    // tie: fewer inflight wins, then round-robin rotation
                    inflight < best_inflight
                        || (inflight == best_inflight
                            && rotates_ahead(registry, kind, pool.len(), idx, best_idx))
                } else {
                    false
                }
            }
        };
        if better {
            best = Some((score, inflight, idx));
        }
    }

    match (best, best_any) {
        (Some((_, _, idx)), _) => SelectOutcome::Chosen(idx),
        (None, Some((_, idx))) if saw_saturated_healthy => SelectOutcome::Saturated(idx),
        _ => {
            registry.attempt_recovery_sweep();
            SelectOutcome::None
        }
    }
}

/// Round-robin tie break: the candidate closer (going forward) to the pool
/// cursor wins. The cursor advances once per consulted tie so repeated ties
/// rotate through the pool.
fn rotates_ahead(
    registry: &UpstreamRegistry,
    kind: UpstreamKind,
    len: usize,
    candidate: usize,
    incumbent: usize,
) -> bool {
    if len == 0 {
        return false;
    }
    let cursor = registry.next_cursor(kind) % len;
    let dist = |i: usize| (i + len - cursor) % len;
    dist(candidate) < dist(incumbent)
}
