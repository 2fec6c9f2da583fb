//! Data Request Descriptors
//!
//! A [`DataRequest`] describes one upstream read: what to fetch, from which
//! pool, in which encoding. Requests are identified by a deterministic
//! 32-byte SHA-256 fingerprint over everything that affects the response, so
//! identical reads coalesce in the cache regardless of which proof issued
//! them.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// 32-byte deterministic request identity.
pub type Fingerprint = [u8; 32];

/// Upstream pool an external read is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Ethereum execution JSON-RPC over HTTPS POST.
    EthRpc,
    /// Beacon chain REST API over HTTPS GET.
    BeaconApi,
    /// Generic REST read (other gateways, period-store masters).
    RestApi,
    /// Served from the local period/chain store; never leaves the process.
    Internal,
}

impl RequestKind {
    fn tag(self) -> u8 {
        match self {
            Self::EthRpc => 0,
            Self::BeaconApi => 1,
            Self::RestApi => 2,
            Self::Internal => 3,
        }
    }
}

/// HTTP verb for the upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVerb {
    Get,
    Post,
}

/// Wire encoding requested from (and expected of) the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    Json,
    Ssz,
    Octet,
}

impl BodyEncoding {
    /// Value for the `Accept` (GET) or `Content-Type` (POST) header.
    #[must_use]
    pub fn mime(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Ssz | Self::Octet => "application/octet-stream",
        }
    }
}

/// Upstream capability flags, matched against a request's preference mask.
pub mod flags {
    /// Upstream can serve a `text/event-stream` subscription.
    pub const EVENT_SOURCE: u8 = 1 << 0;
    /// Upstream is the designated publisher for beacon head/finality events.
    pub const BEACON_EVENT_PUBLISHER: u8 = 1 << 1;
    /// Upstream is another gateway able to answer proof reads directly.
    pub const PROVER: u8 = 1 << 2;
}

/// One upstream read issued by a proof program or by internal fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    pub kind: RequestKind,
    pub verb: HttpVerb,
    /// URL suffix appended to the selected upstream's base URL.
    pub path: String,
    pub payload: Option<Vec<u8>>,
    pub encoding: BodyEncoding,
    /// JSON-RPC method name, when known; drives per-method support tracking
    /// and response classification.
    pub rpc_method: Option<String>,
    /// Cache lifetime hint; `None` falls back to the per-kind default.
    pub ttl: Option<Duration>,
    /// Preferred upstream capability mask (see [`flags`]); matching
    /// upstreams score a selection bonus.
    pub preferred_flags: u8,
    /// Minimum execution block the serving upstream should have observed.
    pub min_block: Option<u64>,
}

impl DataRequest {
    /// An execution-layer JSON-RPC call.
    #[must_use]
    pub fn eth_rpc(method: &str, params: &Value) -> Self {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });
        Self {
            kind: RequestKind::EthRpc,
            verb: HttpVerb::Post,
            path: String::new(),
            payload: Some(body.to_string().into_bytes()),
            encoding: BodyEncoding::Json,
            rpc_method: Some(method.to_string()),
            ttl: None,
            preferred_flags: 0,
            min_block: None,
        }
    }

    /// A beacon REST read. `path` carries no leading slash.
    #[must_use]
    pub fn beacon_get(path: &str, encoding: BodyEncoding) -> Self {
        Self {
            kind: RequestKind::BeaconApi,
            verb: HttpVerb::Get,
            path: path.to_string(),
            payload: None,
            encoding,
            rpc_method: None,
            ttl: None,
            preferred_flags: 0,
            min_block: None,
        }
    }

    /// A generic REST read from the REST/prover pool.
    #[must_use]
    pub fn rest_get(path: &str, encoding: BodyEncoding) -> Self {
        Self {
            kind: RequestKind::RestApi,
            verb: HttpVerb::Get,
            path: path.to_string(),
            payload: None,
            encoding,
            rpc_method: None,
            ttl: None,
            preferred_flags: 0,
            min_block: None,
        }
    }

    /// A read answered from the local period/chain store.
    #[must_use]
    pub fn internal(path: &str) -> Self {
        Self {
            kind: RequestKind::Internal,
            verb: HttpVerb::Get,
            path: path.to_string(),
            payload: None,
            encoding: BodyEncoding::Octet,
            rpc_method: None,
            ttl: None,
            preferred_flags: 0,
            min_block: None,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_min_block(mut self, block: u64) -> Self {
        self.min_block = Some(block);
        self
    }

    #[must_use]
    pub fn with_preferred(mut self, mask: u8) -> Self {
        self.preferred_flags = mask;
        self
    }

    /// Deterministic identity for caching and coalescing. Covers the kind
    /// tag, verb, path, payload, and encoding; TTL hints and selection
    /// preferences do not change what the response is.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update([self.kind.tag()]);
        hasher.update([match self.verb {
            HttpVerb::Get => 0u8,
            HttpVerb::Post => 1u8,
        }]);
        hasher.update([match self.encoding {
            BodyEncoding::Json => 0u8,
            BodyEncoding::Ssz => 1u8,
            BodyEncoding::Octet => 2u8,
        }]);
        hasher.update((self.path.len() as u64).to_le_bytes());
        hasher.update(self.path.as_bytes());
        if let Some(payload) = &self.payload {
            hasher.update((payload.len() as u64).to_le_bytes());
            hasher.update(payload);
        }
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = DataRequest::eth_rpc("eth_getBalance", &serde_json::json!(["0x00", "0x1"]));
        let b = DataRequest::eth_rpc("eth_getBalance", &serde_json::json!(["0x00", "0x1"]));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_separates_params() {
        let a = DataRequest::eth_rpc("eth_getBalance", &serde_json::json!(["0x00", "0x1"]));
        let b = DataRequest::eth_rpc("eth_getBalance", &serde_json::json!(["0x00", "0x2"]));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_separates_kinds() {
        let a = DataRequest::beacon_get("eth/v1/beacon/headers/head", BodyEncoding::Json);
        let mut b = a.clone();
        b.kind = RequestKind::RestApi;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_separates_encodings() {
        let a = DataRequest::beacon_get("eth/v2/beacon/blocks/head", BodyEncoding::Json);
        let b = DataRequest::beacon_get("eth/v2/beacon/blocks/head", BodyEncoding::Ssz);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn ttl_does_not_change_identity() {
        let a = DataRequest::beacon_get("eth/v2/beacon/blocks/head", BodyEncoding::Ssz);
        let b = a.clone().with_ttl(Duration::from_secs(12));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn path_payload_boundary_is_unambiguous() {
        // "ab" + "c" must not collide with "a" + "bc"
        let mut a = DataRequest::rest_get("ab", BodyEncoding::Octet);
        a.payload = Some(b"c".to_vec());
        let mut b = DataRequest::rest_get("a", BodyEncoding::Octet);
        b.payload = Some(b"bc".to_vec());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
