//! Request Context
//!
//! Per-inbound-request state: the identity of the call, its deadline and
//! cancellation flag, and the ledger of data reads a proof program has
//! registered so far. The context is exclusively owned by the task driving
//! the request; completed reads replay from the ledger so the program's
//! state function stays idempotent.

use crate::error::GatewayError;
use crate::request::{DataRequest, Fingerprint};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static NEXT_TRACE: AtomicU64 = AtomicU64::new(1);

/// Cooperative cancellation flag, cloned to whoever watches the client
/// connection.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// State of one registered read.
#[derive(Debug)]
struct ReadSlot {
    request: DataRequest,
    result: Option<Result<Vec<u8>, GatewayError>>,
    /// Runner-level re-arms consumed by retry-or-fatal.
    rearms: u32,
}

/// Per-request context handed to the proof program on every step.
pub struct ProofContext {
    pub method: String,
    pub params: Value,
    pub chain_id: u64,
    pub trace_id: u64,
    pub started: Instant,
    deadline: Instant,
    cancel: CancelToken,
    reads: HashMap<Fingerprint, ReadSlot>,
    /// Fingerprints registered but not yet resolved, in registration order.
    pending: Vec<Fingerprint>,
    error: Option<GatewayError>,
    sync_transition: Option<(u64, u64)>,
}

impl ProofContext {
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        params: Value,
        chain_id: u64,
        deadline: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            method: method.into(),
            params,
            chain_id,
            trace_id: NEXT_TRACE.fetch_add(1, Ordering::Relaxed),
            started: Instant::now(),
            deadline: Instant::now() + deadline,
            cancel,
            reads: HashMap::new(),
            pending: Vec::new(),
            error: None,
            sync_transition: None,
        }
    }

    /// Ask for a read. Returns the completed result if the read already
    /// resolved; otherwise registers it (once) and returns `None`, which the
    /// program answers by returning `Pending` from this step.
    pub fn require(&mut self, dr: &DataRequest) -> Option<Result<Vec<u8>, GatewayError>> {
        let fp = dr.fingerprint();
        if let Some(slot) = self.reads.get(&fp) {
            return slot.result.clone();
        }
        self.reads.insert(
            fp,
            ReadSlot {
                request: dr.clone(),
                result: None,
                rearms: 0,
            },
        );
        self.pending.push(fp);
        None
    }

    /// First-writer-wins error slot.
    pub fn set_error(&mut self, error: GatewayError) {
        self.error.get_or_insert(error);
    }

    #[must_use]
    pub fn error(&self) -> Option<&GatewayError> {
        self.error.as_ref()
    }

    /// Flag that verification needs committee periods `from..to` before this
    /// request can proceed.
    pub fn request_sync_transition(&mut self, from: u64, to: u64) {
        self.sync_transition = Some((from, to));
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    #[must_use]
    pub fn deadline_exceeded(&self) -> bool {
        Instant::now() >= self.deadline
    }

    // --- runner-side accessors ---

    pub(crate) fn take_sync_transition(&mut self) -> Option<(u64, u64)> {
        self.sync_transition.take()
    }

    /// Drain the descriptors awaiting dispatch. Runner-side.
    pub fn take_pending(&mut self) -> Vec<DataRequest> {
        let fps = std::mem::take(&mut self.pending);
        fps.iter()
            .filter_map(|fp| self.reads.get(fp).map(|s| s.request.clone()))
            .collect()
    }

    /// Record a read's outcome. Runner-side.
    pub fn store_result(&mut self, fp: Fingerprint, result: Result<Vec<u8>, GatewayError>) {
        if let Some(slot) = self.reads.get_mut(&fp) {
            slot.result = Some(result);
        }
    }

    /// Failed reads eligible for another dispatch round.
    pub(crate) fn retryable_failures(&self, max_rearms: u32) -> Vec<Fingerprint> {
        self.reads
            .iter()
            .filter(|(_, slot)| {
                slot.rearms < max_rearms
                    && slot
                        .result
                        .as_ref()
                        .is_some_and(|r| r.as_ref().is_err_and(GatewayError::is_retryable))
            })
            .map(|(fp, _)| *fp)
            .collect()
    }

    /// Any failure at all, for surfacing when retry is off the table.
    pub(crate) fn first_failure(&self) -> Option<GatewayError> {
        self.reads
            .values()
            .find_map(|slot| match &slot.result {
                Some(Err(e)) => Some(e.clone()),
                _ => None,
            })
    }

    /// Clear a failed read and queue it for re-dispatch.
    pub(crate) fn rearm(&mut self, fp: Fingerprint) {
        if let Some(slot) = self.reads.get_mut(&fp) {
            slot.rearms += 1;
            slot.result = None;
            self.pending.push(fp);
        }
    }

    #[must_use]
    pub fn read_count(&self) -> usize {
        self.reads.len()
    }
}
