//! Block and Chain-State Programs
//!
//! `eth_getBlockByNumber` / `eth_getBlockByHash` / `eth_getBlockReceipts`
//! answers travel as raw JSON in the `Data` envelope; `eth_chainId` is
//! answered from configuration without touching an upstream, and
//! `eth_blockNumber` rides a single uncached read.

use crate::envelope::{quantity_to_word, DataValue, ProofEnvelope};
use alloy::primitives::U256;
use gateway_engine::{DataRequest, GatewayError, ProofContext, ProofProgram, StepOutcome};
use serde_json::Value;

/// Serves the block-object family.
pub struct BlockProgram {
    method: String,
    params: Value,
}

impl BlockProgram {
    /// # Errors
    /// [`GatewayError::UpstreamUser`] when params are not an array.
    pub fn from_request(method: &str, params: &Value) -> Result<Self, GatewayError> {
        if !params.is_array() {
            return Err(GatewayError::UpstreamUser {
                status: 400,
                message: "params must be an array".into(),
            });
        }
        Ok(Self {
            method: method.to_string(),
            params: params.clone(),
        })
    }
}

impl ProofProgram for BlockProgram {
    fn step(&mut self, ctx: &mut ProofContext) -> StepOutcome {
        let dr = DataRequest::eth_rpc(&self.method, &self.params);
        match ctx.require(&dr) {
            None => StepOutcome::Pending,
            // the dispatcher reports exhausted null/404 answers as absence
            Some(Err(GatewayError::NotFound(_))) => StepOutcome::Error(GatewayError::NotFound(
                format!("{} yielded no block", self.method),
            )),
            Some(Err(e)) => StepOutcome::Error(e),
            Some(Ok(body)) => match serde_json::from_slice::<Value>(&body) {
                Ok(value) => {
                    let result = value.get("result").cloned().unwrap_or(Value::Null);
                    StepOutcome::Success(
                        ProofEnvelope::Data(DataValue::Bytes(result.to_string().into_bytes()))
                            .encode(),
                    )
                }
                Err(e) => StepOutcome::Error(GatewayError::UpstreamServer {
                    status: 200,
                    message: format!("unparseable block response: {e}"),
                }),
            },
        }
    }
}

/// Answers `eth_chainId` from configuration.
pub struct ChainIdProgram {
    chain_id: u64,
}

impl ChainIdProgram {
    #[must_use]
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id }
    }
}

impl ProofProgram for ChainIdProgram {
    fn step(&mut self, _ctx: &mut ProofContext) -> StepOutcome {
        let word = quantity_to_word(U256::from(self.chain_id));
        StepOutcome::Success(ProofEnvelope::Data(DataValue::Uint256(word)).encode())
    }
}

/// Single uncached `eth_blockNumber` read.
pub struct BlockNumberProgram;

impl ProofProgram for BlockNumberProgram {
    fn step(&mut self, ctx: &mut ProofContext) -> StepOutcome {
        let dr = DataRequest::eth_rpc("eth_blockNumber", &Value::Array(Vec::new()));
        match ctx.require(&dr) {
            None => StepOutcome::Pending,
            Some(Err(e)) => StepOutcome::Error(e),
            Some(Ok(body)) => {
                let parsed: Option<U256> = serde_json::from_slice::<Value>(&body)
                    .ok()
                    .and_then(|v| v.get("result").and_then(Value::as_str).map(String::from))
                    .and_then(|hex| U256::from_str_radix(hex.trim_start_matches("0x"), 16).ok());
                match parsed {
                    Some(number) => StepOutcome::Success(
                        ProofEnvelope::Data(DataValue::Uint256(quantity_to_word(number))).encode(),
                    ),
                    None => StepOutcome::Error(GatewayError::UpstreamServer {
                        status: 200,
                        message: "malformed eth_blockNumber response".into(),
                    }),
                }
            }
        }
    }
}
