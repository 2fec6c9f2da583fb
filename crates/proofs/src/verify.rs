//! Local Verification & Result Extraction
//!
//! The `/rpc` path decodes the envelope a program produced, runs it through
//! the pluggable envelope verifier, and renders the JSON-RPC `result`
//! value. The built-in verifier performs structural checks; the full
//! cryptographic verifier library slots in behind the same trait.

use crate::account::AccountWitness;
use crate::envelope::{DataValue, ProofEnvelope};
use alloy::primitives::U256;
use gateway_engine::GatewayError;
use serde_json::Value;

/// Validates a decoded envelope before its value is surfaced.
pub trait EnvelopeVerifier: Send + Sync {
    /// # Errors
    /// Any verification failure; surfaced as a server error to the client.
    fn verify(&self, envelope: &ProofEnvelope, method: &str) -> Result<(), GatewayError>;
}

/// Structural envelope checks: witness bundles must deserialize and carry a
/// non-empty proof.
#[derive(Debug, Default)]
pub struct StructuralEnvelopeVerifier;

impl EnvelopeVerifier for StructuralEnvelopeVerifier {
    fn verify(&self, envelope: &ProofEnvelope, method: &str) -> Result<(), GatewayError> {
        match envelope {
            ProofEnvelope::Data(_) | ProofEnvelope::SyncData(_) => Ok(()),
            ProofEnvelope::Proof(body) => {
                let witness: AccountWitness = ssz_rs::deserialize(body).map_err(|e| {
                    GatewayError::UpstreamServer {
                        status: 200,
                        message: format!("{method} witness does not deserialize: {e}"),
                    }
                })?;
                if witness.account_proof.is_empty() {
                    return Err(GatewayError::UpstreamServer {
                        status: 200,
                        message: format!("{method} witness carries no proof nodes"),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Decode, verify, and render an envelope as a JSON-RPC result value.
///
/// # Errors
/// Decode failures and verifier rejections.
pub fn verify_and_extract(
    verifier: &dyn EnvelopeVerifier,
    encoded: &[u8],
    method: &str,
) -> Result<Value, GatewayError> {
    let envelope = ProofEnvelope::decode(encoded).map_err(|e| GatewayError::UpstreamServer {
        status: 200,
        message: format!("malformed envelope: {e}"),
    })?;
    verifier.verify(&envelope, method)?;

    Ok(match envelope {
        ProofEnvelope::Data(DataValue::Uint256(word)) => {
            Value::String(format!("0x{:x}", U256::from_be_bytes(word)))
        }
        ProofEnvelope::Data(DataValue::Bytes(bytes)) => {
            // block-shaped payloads are JSON; everything else renders as hex
            serde_json::from_slice::<Value>(&bytes)
                .unwrap_or_else(|_| Value::String(format!("0x{}", hex::encode(&bytes))))
        }
        ProofEnvelope::Proof(body) | ProofEnvelope::SyncData(body) => {
            Value::String(format!("0x{}", hex::encode(body)))
        }
    })
}
