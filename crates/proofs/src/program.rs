//! Program Registry
//!
//! Maps an inbound JSON-RPC method to the proof program that serves it.

use crate::account::AccountProgram;
use crate::block::{BlockNumberProgram, BlockProgram, ChainIdProgram};
use gateway_engine::{GatewayError, ProofProgram};
use serde_json::Value;

/// Methods the proof path can serve.
pub const SUPPORTED_METHODS: [&str; 10] = [
    "eth_getBalance",
    "eth_getTransactionCount",
    "eth_getStorageAt",
    "eth_getCode",
    "eth_getProof",
    "eth_getBlockByNumber",
    "eth_getBlockByHash",
    "eth_getBlockReceipts",
    "eth_chainId",
    "eth_blockNumber",
];

/// Instantiate the program for a request.
///
/// # Errors
/// [`GatewayError::UpstreamUser`] for unknown methods or malformed params.
pub fn program_for(
    method: &str,
    params: &Value,
    chain_id: u64,
) -> Result<Box<dyn ProofProgram>, GatewayError> {
    tracing::debug!(method, "selecting proof program");
    match method {
        "eth_getBalance" | "eth_getTransactionCount" | "eth_getStorageAt" | "eth_getCode"
        | "eth_getProof" => Ok(Box::new(AccountProgram::from_request(method, params)?)),
        "eth_getBlockByNumber" | "eth_getBlockByHash" | "eth_getBlockReceipts" => {
            Ok(Box::new(BlockProgram::from_request(method, params)?))
        }
        "eth_chainId" => Ok(Box::new(ChainIdProgram::new(chain_id))),
        "eth_blockNumber" => Ok(Box::new(BlockNumberProgram)),
        other => Err(GatewayError::UpstreamUser {
            status: 400,
            message: format!("method {other} has no proof program"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_methods_resolve() {
        const ADDRESS: &str = "0x0000000000000000000000000000000000000000";
        for method in SUPPORTED_METHODS {
            let params = match method {
                "eth_getBalance" | "eth_getTransactionCount" | "eth_getCode" => {
                    json!([ADDRESS, "0x1"])
                }
                "eth_getStorageAt" => json!([ADDRESS, "0x0", "0x1"]),
                "eth_getProof" => json!([ADDRESS, [], "0x1"]),
                "eth_getBlockByNumber" => json!(["0x1", false]),
                "eth_getBlockByHash" => json!([format!("0x{}", "11".repeat(32)), false]),
                "eth_getBlockReceipts" => json!(["0x1"]),
                _ => json!([]),
            };
            assert!(program_for(method, &params, 1).is_ok(), "{method}");
        }
    }

    #[test]
    fn unknown_method_is_user_error() {
        let err = program_for("eth_sendRawTransaction", &json!([]), 1).unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUser { .. }));
    }
}
