//! Engine Error Kinds
//!
//! One value-kind enum shared across the engine. Errors are cloneable so a
//! coalesced cache entry can hand the same terminal failure to every waiter.

use thiserror::Error;

/// Errors produced and propagated by the gateway engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Connect/read/TLS/timeout failure before a usable response arrived.
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream answered but the answer is a server-side failure.
    #[error("upstream server error (status {status}): {message}")]
    UpstreamServer { status: u16, message: String },

    /// Upstream rejected the request itself; surfaced verbatim, not retried.
    #[error("upstream rejected request (status {status}): {message}")]
    UpstreamUser { status: u16, message: String },

    /// The (upstream, method) pair is unsupported; triggers reselection.
    #[error("method {method} not supported by upstream")]
    MethodNotSupported { method: String },

    /// Expected absence, reported separately so proof logic can distinguish
    /// a missing value from a failure.
    #[error("not found: {0}")]
    NotFound(String),

    /// The verifier lacks a sync-committee period; an internal update
    /// procedure runs before the original proof resumes.
    #[error("sync committee transition required from period {from} to {to}")]
    SyncTransitionRequired { from: u64, to: u64 },

    /// No remaining upstream candidate, or the cache refused more work.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The inbound connection closed; the request context is cancelled.
    #[error("client disconnected")]
    ClientGone,

    /// Malformed configuration or an unrecoverable runtime failure.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl GatewayError {
    /// Whether another attempt on a different upstream may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::UpstreamServer { .. }
                | Self::ResourceExhausted(_)
                | Self::MethodNotSupported { .. }
        )
    }

    /// HTTP status for the user-visible response body.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::UpstreamUser { .. } => 400,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(GatewayError::Transport("reset".into()).is_retryable());
        assert!(GatewayError::UpstreamServer {
            status: 502,
            message: "bad gateway".into()
        }
        .is_retryable());
        assert!(!GatewayError::UpstreamUser {
            status: 400,
            message: "nonce too low".into()
        }
        .is_retryable());
        assert!(!GatewayError::ClientGone.is_retryable());
        assert!(!GatewayError::NotFound("block".into()).is_retryable());
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(
            GatewayError::UpstreamUser {
                status: 400,
                message: String::new()
            }
            .http_status(),
            400
        );
        assert_eq!(GatewayError::Fatal("boom".into()).http_status(), 500);
        assert_eq!(GatewayError::ClientGone.http_status(), 500);
    }
}
