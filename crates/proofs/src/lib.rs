//! # Gateway Proofs
//!
//! Proof programs the stateless gateway drives, the SSZ proof envelope they
//! emit, and the local verification seam consulted before a `/rpc` answer
//! leaves the process.

pub mod account;
pub mod block;
pub mod envelope;
pub mod program;
pub mod verify;

pub use account::{AccountProgram, AccountWitness};
pub use block::{BlockNumberProgram, BlockProgram, ChainIdProgram};
pub use envelope::{DataValue, EnvelopeError, ProofEnvelope};
pub use program::{program_for, SUPPORTED_METHODS};
pub use verify::{verify_and_extract, EnvelopeVerifier, StructuralEnvelopeVerifier};
