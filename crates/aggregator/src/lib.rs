//! PriceMesh Aggregator
//!
//! The per-topic aggregation state machine and its supervisor. While a
//! node is leader for a topic it paces rounds; every node answers round
//! triggers with its latest local observation, collects a quorum of
//! submissions, signs the median, collects a quorum of signatures, and
//! persists the finalized aggregate exactly once per round.

pub mod aggregator;
pub mod app;
pub mod messages;
pub mod rounds;
#[cfg(test)]
mod tests;

pub use aggregator::Aggregator;
pub use app::AggregatorApp;
pub use messages::{PriceDataMessage, ProofMessage, TriggerMessage};
pub use rounds::{meets_quorum, RoundPrices, RoundProofs, RoundTriggers, Submission};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("signer error: {0}")]
    Signer(#[from] pricemesh_crypto::SignerError),
    #[error("store error: {0}")]
    Store(#[from] pricemesh_store::StoreError),
    #[error("network error: {0}")]
    Network(#[from] pricemesh_network::NetworkError),
    #[error("raft error: {0}")]
    Raft(#[from] pricemesh_raft::RaftError),
    #[error("settings error: {0}")]
    Settings(#[from] pricemesh_settings::SettingsError),
    #[error("no aggregator with id {0}")]
    UnknownAggregator(i32),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("missing or invalid params: {0}")]
    InvalidParams(String),
    #[error("app is already running")]
    AlreadyRunning,
}
