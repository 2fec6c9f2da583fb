//! Account Proof Programs
//!
//! Serves the account-state family (`eth_getBalance`,
//! `eth_getTransactionCount`, `eth_getStorageAt`, `eth_getCode`,
//! `eth_getProof`) by fanning out an `eth_getProof` (or `eth_getCode`) read
//! and a beacon anchor-block read, then folding the answer into the proof
//! envelope. Witness bundles are SSZ containers; plain values travel as
//! `Data`.

use crate::envelope::{quantity_to_word, DataValue, ProofEnvelope};
use alloy::primitives::{Address, U256};
use gateway_engine::{
    BodyEncoding, DataRequest, GatewayError, ProofContext, ProofProgram, StepOutcome,
};
use serde_json::{json, Value};
use ssz_rs::prelude::*;
use std::str::FromStr;

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AccountQuery {
    Balance,
    Nonce,
    Code,
    Storage(String),
    /// Full witness bundle.
    Witness,
}

/// SSZ witness for an account read, anchored to an execution state root.
#[derive(Debug, Clone, Default, PartialEq, Eq, SimpleSerialize)]
pub struct AccountWitness {
    /// Account address.
    pub address: Vector<u8, 20>,
    /// Account balance as a 32-byte big-endian word.
    pub balance: [u8; 32],
    /// Account nonce.
    pub nonce: u64,
    /// Keccak of the account's code.
    pub code_hash: [u8; 32],
    /// Root of the account's storage trie.
    pub storage_hash: [u8; 32],
    /// RLP nodes of the account's Patricia proof.
    pub account_proof: List<List<u8, 1024>, 64>,
}

/// Program implementation for the account-state family.
#[derive(Debug)]
pub struct AccountProgram {
    query: AccountQuery,
    address: String,
    block: String,
    rpc_method: &'static str,
}

impl AccountProgram {
    /// Build a program from the inbound method and params.
    ///
    /// # Errors
    /// [`GatewayError::UpstreamUser`] on malformed or missing params.
    pub fn from_request(method: &str, params: &Value) -> Result<Self, GatewayError> {
        let args = params
            .as_array()
            .ok_or_else(|| user_error("params must be an array"))?;
        let address = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| user_error("missing account address"))?;
        Address::from_str(address).map_err(|_| user_error("invalid account address"))?;

        let (query, block_arg, rpc_method) = match method {
            "eth_getBalance" => (AccountQuery::Balance, args.get(1), "eth_getProof"),
            "eth_getTransactionCount" => (AccountQuery::Nonce, args.get(1), "eth_getProof"),
            "eth_getCode" => (AccountQuery::Code, args.get(1), "eth_getCode"),
            "eth_getProof" => (AccountQuery::Witness, args.get(2), "eth_getProof"),
            "eth_getStorageAt" => {
                let slot = args
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| user_error("missing storage slot"))?;
                (AccountQuery::Storage(slot.to_string()), args.get(2), "eth_getProof")
            }
            other => return Err(user_error(&format!("unsupported account method {other}"))),
        };

        Ok(Self {
            query,
            address: address.to_string(),
            block: parse_block_tag(block_arg)?,
            rpc_method,
        })
    }

    fn state_read(&self) -> DataRequest {
        match (&self.query, self.rpc_method) {
            (AccountQuery::Storage(slot), _) => DataRequest::eth_rpc(
                "eth_getProof",
                &json!([self.address, [slot], self.block]),
            ),
            (_, "eth_getCode") => {
                DataRequest::eth_rpc("eth_getCode", &json!([self.address, self.block]))
            }
            _ => DataRequest::eth_rpc(
                "eth_getProof",
                &json!([self.address, Vec::<String>::new(), self.block]),
            ),
        }
    }

    fn assemble(&self, state_body: &[u8]) -> StepOutcome {
        let value: Value = match serde_json::from_slice(state_body) {
            Ok(value) => value,
            Err(e) => {
                return StepOutcome::Error(GatewayError::UpstreamServer {
                    status: 200,
                    message: format!("unparseable state response: {e}"),
                })
            }
        };
        let result = &value["result"];
        if result.is_null() {
            return StepOutcome::Error(GatewayError::NotFound(format!(
                "account {} at block {}",
                self.address, self.block
            )));
        }

        let envelope = match &self.query {
            AccountQuery::Balance => match parse_word(&result["balance"]) {
                Ok(word) => ProofEnvelope::Data(DataValue::Uint256(word)),
                Err(e) => return StepOutcome::Error(e),
            },
            AccountQuery::Nonce => match parse_word(&result["nonce"]) {
                Ok(word) => ProofEnvelope::Data(DataValue::Uint256(word)),
                Err(e) => return StepOutcome::Error(e),
            },
            AccountQuery::Storage(_) => {
                let slot_value = &result["storageProof"][0]["value"];
                match parse_word(slot_value) {
                    Ok(word) => ProofEnvelope::Data(DataValue::Uint256(word)),
                    Err(e) => return StepOutcome::Error(e),
                }
            }
            AccountQuery::Code => match result.as_str().map(decode_hex_bytes) {
                Some(Ok(bytes)) => ProofEnvelope::Data(DataValue::Bytes(bytes)),
                _ => {
                    return StepOutcome::Error(GatewayError::UpstreamServer {
                        status: 200,
                        message: "malformed code response".into(),
                    })
                }
            },
            AccountQuery::Witness => match self.build_witness(result) {
                Ok(witness) => match ssz_rs::serialize(&witness) {
                    Ok(body) => ProofEnvelope::Proof(body),
                    Err(e) => {
                        return StepOutcome::Error(GatewayError::Fatal(format!(
                            "witness serialization: {e}"
                        )))
                    }
                },
                Err(e) => return StepOutcome::Error(e),
            },
        };
        StepOutcome::Success(envelope.encode())
    }

    fn build_witness(&self, result: &Value) -> Result<AccountWitness, GatewayError> {
        let address = Address::from_str(&self.address)
            .map_err(|_| user_error("invalid account address"))?;
        let account_proof = result["accountProof"]
            .as_array()
            .ok_or_else(|| user_error("missing accountProof"))?;

        let mut raw_nodes = Vec::with_capacity(account_proof.len());
        for node in account_proof {
            let raw = node
                .as_str()
                .map(decode_hex_bytes)
                .transpose()
                .ok()
                .flatten()
                .ok_or_else(|| user_error("malformed proof node"))?;
            let node_list: List<u8, 1024> = raw
                .try_into()
                .map_err(|_| user_error("oversized proof node"))?;
            raw_nodes.push(node_list);
        }
        let nodes: List<List<u8, 1024>, 64> = raw_nodes
            .try_into()
            .map_err(|_| user_error("proof has too many nodes"))?;

        Ok(AccountWitness {
            address: Vector::try_from(address.to_vec())
                .map_err(|_| user_error("invalid address length"))?,
            balance: parse_word(&result["balance"])?,
            nonce: parse_quantity(&result["nonce"])?,
            code_hash: parse_hash(&result["codeHash"])?,
            storage_hash: parse_hash(&result["storageHash"])?,
            account_proof: nodes,
        })
    }
}

impl ProofProgram for AccountProgram {
    fn step(&mut self, ctx: &mut ProofContext) -> StepOutcome {
        let state = ctx.require(&self.state_read());
        let anchor = ctx.require(&DataRequest::beacon_get(
            "eth/v2/beacon/blocks/head",
            BodyEncoding::Json,
        ));
        match (state, anchor) {
            (Some(Ok(body)), Some(Ok(_anchor))) => self.assemble(&body),
            (Some(Err(e)), _) | (_, Some(Err(e))) => StepOutcome::Error(e),
            _ => StepOutcome::Pending,
        }
    }

    fn cpu_heavy(&self) -> bool {
        matches!(self.query, AccountQuery::Witness)
    }
}

fn user_error(message: &str) -> GatewayError {
    GatewayError::UpstreamUser {
        status: 400,
        message: message.to_string(),
    }
}

/// Block tags arrive as a plain string or as `{"block": "..."}`.
fn parse_block_tag(value: Option<&Value>) -> Result<String, GatewayError> {
    match value {
        None => Ok("latest".to_string()),
        Some(Value::String(tag)) => Ok(tag.clone()),
        Some(Value::Object(map)) => map
            .get("block")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| user_error("block object missing \"block\"")),
        Some(_) => Err(user_error("invalid block parameter")),
    }
}

fn parse_word(value: &Value) -> Result<[u8; 32], GatewayError> {
    let text = value
        .as_str()
        .ok_or_else(|| user_error("expected quantity string"))?;
    let quantity = U256::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|_| user_error("invalid quantity"))?;
    Ok(quantity_to_word(quantity))
}

fn parse_quantity(value: &Value) -> Result<u64, GatewayError> {
    let text = value
        .as_str()
        .ok_or_else(|| user_error("expected quantity string"))?;
    u64::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|_| user_error("invalid quantity"))
}

fn parse_hash(value: &Value) -> Result<[u8; 32], GatewayError> {
    let bytes = value
        .as_str()
        .map(decode_hex_bytes)
        .transpose()
        .ok()
        .flatten()
        .ok_or_else(|| user_error("expected 32-byte hash"))?;
    bytes.try_into().map_err(|_| user_error("expected 32-byte hash"))
}

fn decode_hex_bytes(text: &str) -> Result<Vec<u8>, GatewayError> {
    hex::decode(text.trim_start_matches("0x")).map_err(|_| user_error("invalid hex"))
}
