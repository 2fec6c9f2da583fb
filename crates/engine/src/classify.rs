//! Response Classification
//!
//! Maps an upstream attempt's outcome (HTTP status, body bytes, request
//! descriptor) to a [`ResponseClass`]. The classification is a pure function
//! of its inputs; the dispatcher turns classes into retry/failover decisions
//! and the registry turns them into health signals.

use crate::request::{DataRequest, RequestKind};
use serde_json::Value;

/// Outcome class of a single upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// Usable response body.
    Success,
    /// Worth repeating on another upstream (or the same one later).
    Retry,
    /// The request itself is at fault; surfaced to the client verbatim.
    UserError,
    /// This upstream cannot serve this method; reselect and remember.
    MethodNotSupported,
    /// Expected absence (missing block, header, bootstrap).
    NotFound,
}

/// Sentinel status for attempts that failed before any HTTP response.
pub const STATUS_TRANSPORT: u16 = 0;

/// JSON-RPC methods where a `"result":null` body means the upstream has not
/// caught up yet rather than a definitive answer.
const NULL_RESULT_RETRY_METHODS: [&str; 3] = [
    "eth_getBlockByHash",
    "eth_getBlockByNumber",
    "eth_getBlockReceipts",
];

/// Beacon paths where a 404 usually means "not propagated here yet".
const BEACON_RETRYABLE_404_PATHS: [&str; 4] = [
    "beacon/blocks",
    "beacon/headers",
    "light_client/bootstrap",
    "light_client/updates",
];

/// Classify one upstream attempt. First matching rule wins.
#[must_use]
pub fn classify(status: u16, body: &[u8], req: &DataRequest) -> ResponseClass {
    if (200..300).contains(&status) {
        return classify_2xx(body, req);
    }

    // Transport failures and anything below 400 (stray 1xx/3xx after
    // redirect handling) are worth another upstream.
    if status < 400 || status >= 500 {
        return ResponseClass::Retry;
    }

    match status {
        401 | 429 => ResponseClass::Retry,
        403 => match json_rpc_error(body) {
            Some((code, message)) => classify_rpc_code(code, &message, req),
            None => ResponseClass::UserError,
        },
        400 => classify_400(body, req),
        404 => classify_404(body, req),
        _ => ResponseClass::UserError,
    }
}

fn classify_2xx(body: &[u8], req: &DataRequest) -> ResponseClass {
    if req.kind != RequestKind::EthRpc {
        return ResponseClass::Success;
    }
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return ResponseClass::Success;
    };
    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return classify_rpc_code(code, &message, req);
    }
    if value.get("result").is_some_and(Value::is_null) && is_null_result_retry(req) {
        return ResponseClass::Retry;
    }
    ResponseClass::Success
}

fn classify_400(body: &[u8], req: &DataRequest) -> ResponseClass {
    match req.kind {
        RequestKind::BeaconApi if contains_ignore_case(body, "unsupported method") => {
            ResponseClass::MethodNotSupported
        }
        RequestKind::EthRpc => match json_rpc_error(body) {
            Some((code, message)) => classify_rpc_code(code, &message, req),
            None => ResponseClass::UserError,
        },
        _ => ResponseClass::UserError,
    }
}

fn classify_404(body: &[u8], req: &DataRequest) -> ResponseClass {
    let beacon_miss = req.kind == RequestKind::BeaconApi
        && BEACON_RETRYABLE_404_PATHS
            .iter()
            .any(|p| req.path.contains(p))
        && (contains_ignore_case(body, "not found")
            || contains_ignore_case(body, "bootstrap unavailable"));
    if beacon_miss {
        ResponseClass::Retry
    } else {
        ResponseClass::UserError
    }
}

/// JSON-RPC error-code decision table.
fn classify_rpc_code(code: i64, message: &str, req: &DataRequest) -> ResponseClass {
    match code {
        -32601 | -32004 => ResponseClass::MethodNotSupported,
        -32005 | -32029 | -32009 | -32011 | -32603 | -32001 | -32002 => ResponseClass::Retry,
        -32700 | -32003 | -32015 | 3 => ResponseClass::UserError,
        -32602 | -32000 => classify_rpc_message(code, message, req),
        _ => ResponseClass::Retry,
    }
}

/// Codes −32602 and −32000 carry provider-specific meanings; the message
/// text decides.
fn classify_rpc_message(code: i64, message: &str, req: &DataRequest) -> ResponseClass {
    let lower = message.to_ascii_lowercase();

    if req.rpc_method.as_deref() == Some("eth_getProof")
        && (lower.contains("proof window") || lower.contains("state not available"))
    {
        return ResponseClass::MethodNotSupported;
    }
    if ["tier", "plan", "upgrade", "exceeds the limit"]
        .iter()
        .any(|m| lower.contains(m))
    {
        return ResponseClass::MethodNotSupported;
    }
    if ["header not found", "block not found", "timeout", "in the future"]
        .iter()
        .any(|m| lower.contains(m))
    {
        return ResponseClass::Retry;
    }
    if ["nonce too low", "gas limit"].iter().any(|m| lower.contains(m)) {
        return ResponseClass::UserError;
    }

    // -32602 without a recognized pattern is an invalid-params complaint.
    if code == -32602 {
        ResponseClass::UserError
    } else {
        ResponseClass::Retry
    }
}

/// Whether a failed or empty response means the value genuinely does not
/// exist, as opposed to this upstream being unable to produce it. Proof
/// logic uses this to turn absences into [`ResponseClass::NotFound`]-shaped
/// answers instead of failures.
#[must_use]
pub fn error_indicates_not_found(status: u16, req: &DataRequest, body: &[u8]) -> bool {
    if status == 404
        && req.kind == RequestKind::BeaconApi
        && BEACON_RETRYABLE_404_PATHS
            .iter()
            .any(|p| req.path.contains(p))
    {
        return true;
    }
    if req.kind == RequestKind::EthRpc {
        if let Ok(value) = serde_json::from_slice::<Value>(body) {
            if value.get("result").is_some_and(Value::is_null) {
                return true;
            }
            if let Some(message) = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
            {
                let lower = message.to_ascii_lowercase();
                return lower.contains("not found") || lower.contains("unknown block");
            }
        }
    }
    false
}

fn is_null_result_retry(req: &DataRequest) -> bool {
    req.rpc_method
        .as_deref()
        .is_some_and(|m| NULL_RESULT_RETRY_METHODS.contains(&m))
}

fn json_rpc_error(body: &[u8]) -> Option<(i64, String)> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let error = value.get("error")?;
    let code = error.get("code").and_then(Value::as_i64)?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some((code, message))
}

fn contains_ignore_case(body: &[u8], needle: &str) -> bool {
    let Ok(text) = std::str::from_utf8(body) else {
        return false;
    };
    text.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
}
