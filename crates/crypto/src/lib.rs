//! PriceMesh Crypto
//!
//! Ed25519 primitives for the oracle cluster: keypair management and the
//! aggregate-tuple [`Signer`] shared by all aggregators in a process.

pub mod keys;
pub mod signer;

pub use keys::{KeyError, SigningKeypair};
pub use signer::{aggregate_signing_bytes, Signer, SignerError};
