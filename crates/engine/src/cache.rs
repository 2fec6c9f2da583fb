//! Coalescing Response Cache
//!
//! Hash-keyed response store with TTLs and in-flight deduplication. The
//! first caller for a fingerprint becomes the leader and dispatches; every
//! concurrent caller joins the pending entry and receives the leader's
//! result. A leader that disappears without completing broadcasts a
//! terminal error, so joiners are never stranded.

use crate::error::GatewayError;
use crate::request::{DataRequest, Fingerprint, RequestKind};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Result type delivered to joiners; errors are shared verbatim.
pub type CacheResult = Result<Vec<u8>, GatewayError>;

/// Cache tuning knobs and TTL policy.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry budget; lookups that would insert past it degrade to
    /// no-cache dispatch instead of blocking.
    pub max_entries: usize,
    /// Beacon `blocks/head` style reads.
    pub head_ttl: Duration,
    /// Other beacon reads (finalized data, bootstraps, updates).
    pub beacon_ttl: Duration,
    /// Execution reads pinned to a concrete block.
    pub finalized_rpc_ttl: Duration,
    /// Generic REST reads.
    pub rest_ttl: Duration,
    /// Period between expiry sweeps.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            head_ttl: Duration::from_secs(12),
            beacon_ttl: Duration::from_secs(24 * 3600),
            finalized_rpc_ttl: Duration::from_secs(24 * 3600),
            rest_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
enum Entry {
    Pending { tx: broadcast::Sender<CacheResult> },
    Present { bytes: Vec<u8>, expires: Instant },
}

/// Outcome of a cache lookup.
pub enum Lookup {
    /// Fresh entry; payload is an independent copy.
    Hit(Vec<u8>),
    /// Someone else is already fetching this fingerprint.
    Join(broadcast::Receiver<CacheResult>),
    /// Caller is the leader and must complete the guard.
    Lead(LeadGuard),
    /// Uncacheable request or entry budget exceeded; dispatch directly.
    Bypass,
}

/// Counters for the status endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub joins: u64,
    pub misses: u64,
    pub bypasses: u64,
}

/// Shared coalescing cache.
#[derive(Debug)]
pub struct CoalescingCache {
    entries: DashMap<Fingerprint, Entry>,
    config: CacheConfig,
    hits: AtomicU64,
    joins: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
}

impl CoalescingCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            config,
            hits: AtomicU64::new(0),
            joins: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bypasses: AtomicU64::new(0),
        })
    }

    /// TTL for a request, from its hint or the per-kind policy. Zero means
    /// uncacheable.
    #[must_use]
    pub fn ttl_for(&self, dr: &DataRequest) -> Duration {
        if let Some(ttl) = dr.ttl {
            return ttl;
        }
        match dr.kind {
            RequestKind::BeaconApi => {
                if dr.path.ends_with("/head") || dr.path.contains("/head?") {
                    self.config.head_ttl
                } else {
                    self.config.beacon_ttl
                }
            }
            RequestKind::EthRpc => {
                let tied_to_tip = dr.payload.as_ref().is_some_and(|p| {
                    let text = String::from_utf8_lossy(p);
                    text.contains("\"latest\"") || text.contains("\"pending\"")
                });
                if tied_to_tip {
                    Duration::ZERO
                } else {
                    self.config.finalized_rpc_ttl
                }
            }
            RequestKind::RestApi => self.config.rest_ttl,
            RequestKind::Internal => Duration::ZERO,
        }
    }

    /// Look up a request, becoming leader, joiner, or hit.
    #[must_use]
    pub fn lookup(self: &Arc<Self>, dr: &DataRequest) -> Lookup {
        let ttl = self.ttl_for(dr);
        if ttl.is_zero() {
            self.bypasses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Bypass;
        }
        let fp = dr.fingerprint();
        let now = Instant::now();
        // budget check happens before the shard lock below; len() walks
        // every shard and must not run while one is held
        let over_budget = self.entries.len() >= self.config.max_entries;

        match self.entries.entry(fp) {
            MapEntry::Occupied(mut occupied) => match occupied.get() {
                Entry::Present { bytes, expires } if *expires > now => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("gateway_cache_total", "outcome" => "hit").increment(1);
                    Lookup::Hit(bytes.clone())
                }
                Entry::Present { .. } => {
                    let (tx, _) = broadcast::channel(4);
                    occupied.insert(Entry::Pending { tx: tx.clone() });
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("gateway_cache_total", "outcome" => "refresh").increment(1);
                    Lookup::Lead(LeadGuard {
                        cache: Arc::clone(self),
                        fp,
                        tx,
                        done: false,
                    })
                }
                Entry::Pending { tx } => {
                    self.joins.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("gateway_cache_total", "outcome" => "join").increment(1);
                    Lookup::Join(tx.subscribe())
                }
            },
            MapEntry::Vacant(vacant) => {
                if over_budget {
                    drop(vacant);
                    self.bypasses.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("gateway_cache_total", "outcome" => "bypass").increment(1);
                    return Lookup::Bypass;
                }
                let (tx, _) = broadcast::channel(4);
                vacant.insert(Entry::Pending { tx: tx.clone() });
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_cache_total", "outcome" => "miss").increment(1);
                Lookup::Lead(LeadGuard {
                    cache: Arc::clone(self),
                    fp,
                    tx,
                    done: false,
                })
            }
        }
    }

    /// Inject a response from outside the leader path (head-event
    /// prefetch). Pending waiters complete; present entries are refreshed.
    pub fn publish(&self, fp: Fingerprint, bytes: Vec<u8>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let expires = Instant::now() + ttl;
        let pending_tx = match self.entries.entry(fp) {
            MapEntry::Occupied(mut occupied) => {
                let tx = match occupied.get() {
                    Entry::Pending { tx } => Some(tx.clone()),
                    Entry::Present { .. } => None,
                };
                occupied.insert(Entry::Present {
                    bytes: bytes.clone(),
                    expires,
                });
                tx
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::Present {
                    bytes: bytes.clone(),
                    expires,
                });
                None
            }
        };
        if let Some(tx) = pending_tx {
            let _ = tx.send(Ok(bytes));
        }
    }

    /// Leader completion. Entry state is replaced first so lookups racing
    /// the broadcast observe a consistent store.
    fn finish(&self, fp: Fingerprint, tx: &broadcast::Sender<CacheResult>, result: CacheResult, ttl: Duration) {
        match &result {
            Ok(bytes) if !ttl.is_zero() => {
                self.entries.insert(
                    fp,
                    Entry::Present {
                        bytes: bytes.clone(),
                        expires: Instant::now() + ttl,
                    },
                );
            }
            _ => {
                // failures and uncacheable results leave no entry behind
                self.entries.remove_if(&fp, |_, e| matches!(e, Entry::Pending { .. }));
            }
        }
        let _ = tx.send(result);
    }

    /// Drop expired present entries. Pending entries always survive.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| !matches!(entry, Entry::Present { expires, .. } if *expires <= now));
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_interval
    }
}

/// Exclusive completion handle held by the leader of a pending entry.
pub struct LeadGuard {
    cache: Arc<CoalescingCache>,
    fp: Fingerprint,
    tx: broadcast::Sender<CacheResult>,
    done: bool,
}

impl LeadGuard {
    /// Store the result and wake every joiner exactly once.
    pub fn complete(mut self, result: CacheResult, ttl: Duration) {
        self.done = true;
        self.cache.finish(self.fp, &self.tx, result, ttl);
    }
}

impl Drop for LeadGuard {
    fn drop(&mut self) {
        if !self.done {
            self.cache.finish(
                self.fp,
                &self.tx,
                Err(GatewayError::Fatal("cache leader abandoned the fetch".into())),
                Duration::ZERO,
            );
        }
    }
}
