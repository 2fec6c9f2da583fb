//! Proof Envelope
//!
//! The top-level SSZ union the gateway emits: a one-byte selector followed
//! by the variant body. Verified answers that need no witness travel as
//! `Data`; witness-carrying answers as `Proof`; committee material as
//! `SyncData`. `Data` is itself a union of a 32-byte big-endian quantity
//! and raw bytes.

use thiserror::Error;

/// Envelope decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("empty envelope")]
    Empty,
    #[error("unknown selector {0}")]
    UnknownSelector(u8),
    #[error("truncated {0} body")]
    Truncated(&'static str),
}

/// Inner value union of the `Data` variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataValue {
    /// Left-padded 32-byte big-endian quantity (balances, nonces, slots).
    Uint256([u8; 32]),
    /// Raw bytes (code, encoded blocks).
    Bytes(Vec<u8>),
}

impl DataValue {
    const SELECTOR_UINT256: u8 = 1;
    const SELECTOR_BYTES: u8 = 2;

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Uint256(words) => {
                out.push(Self::SELECTOR_UINT256);
                out.extend_from_slice(words);
            }
            Self::Bytes(bytes) => {
                out.push(Self::SELECTOR_BYTES);
                out.extend_from_slice(bytes);
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let (&selector, body) = bytes.split_first().ok_or(EnvelopeError::Truncated("data"))?;
        match selector {
            Self::SELECTOR_UINT256 => {
                let words: [u8; 32] = body
                    .try_into()
                    .map_err(|_| EnvelopeError::Truncated("uint256"))?;
                Ok(Self::Uint256(words))
            }
            Self::SELECTOR_BYTES => Ok(Self::Bytes(body.to_vec())),
            other => Err(EnvelopeError::UnknownSelector(other)),
        }
    }
}

/// The proof envelope union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofEnvelope {
    /// Selector 1: a verified value with no attached witness.
    Data(DataValue),
    /// Selector 2: SSZ-serialized witness bundle.
    Proof(Vec<u8>),
    /// Selector 3: sync-committee material.
    SyncData(Vec<u8>),
}

impl ProofEnvelope {
    const SELECTOR_DATA: u8 = 1;
    const SELECTOR_PROOF: u8 = 2;
    const SELECTOR_SYNC: u8 = 3;

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Data(value) => {
                out.push(Self::SELECTOR_DATA);
                value.encode_into(&mut out);
            }
            Self::Proof(body) => {
                out.push(Self::SELECTOR_PROOF);
                out.extend_from_slice(body);
            }
            Self::SyncData(body) => {
                out.push(Self::SELECTOR_SYNC);
                out.extend_from_slice(body);
            }
        }
        out
    }

    /// # Errors
    /// Truncated or unknown-selector inputs.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let (&selector, body) = bytes.split_first().ok_or(EnvelopeError::Empty)?;
        match selector {
            Self::SELECTOR_DATA => Ok(Self::Data(DataValue::decode(body)?)),
            Self::SELECTOR_PROOF => Ok(Self::Proof(body.to_vec())),
            Self::SELECTOR_SYNC => Ok(Self::SyncData(body.to_vec())),
            other => Err(EnvelopeError::UnknownSelector(other)),
        }
    }
}

/// Left-pad a big-endian quantity into a 32-byte word.
#[must_use]
pub fn quantity_to_word(value: alloy::primitives::U256) -> [u8; 32] {
    value.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    #[test]
    fn balance_envelope_layout() {
        let word = quantity_to_word(U256::from(0x0au64));
        let envelope = ProofEnvelope::Data(DataValue::Uint256(word));
        let encoded = envelope.encode();

        assert_eq!(encoded[0], 1, "envelope selector");
        assert_eq!(encoded[1], 1, "value selector");
        assert_eq!(&encoded[2..33], &[0u8; 31]);
        assert_eq!(encoded[33], 0x0a);
        assert_eq!(encoded.len(), 34);
    }

    #[test]
    fn decode_round_trip() {
        for envelope in [
            ProofEnvelope::Data(DataValue::Uint256([7u8; 32])),
            ProofEnvelope::Data(DataValue::Bytes(vec![1, 2, 3])),
            ProofEnvelope::Proof(vec![9, 9]),
            ProofEnvelope::SyncData(vec![]),
        ] {
            assert_eq!(ProofEnvelope::decode(&envelope.encode()).unwrap(), envelope);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(ProofEnvelope::decode(&[]), Err(EnvelopeError::Empty));
        assert_eq!(
            ProofEnvelope::decode(&[9, 1]),
            Err(EnvelopeError::UnknownSelector(9))
        );
        assert_eq!(
            ProofEnvelope::decode(&[1, 1, 0]),
            Err(EnvelopeError::Truncated("uint256"))
        );
    }
}
