//! PriceMesh Raft
//!
//! Per-topic leader election and application-message broadcast over a
//! gossip topic. One [`Raft`] runs per aggregation topic; it keeps
//! exactly one leader per term, delivers non-election frames to the
//! application through the [`RaftApp`] upcall, and runs the leader-job
//! ticker that paces aggregation rounds.
//!
//! Election state is ephemeral. A restarted node rejoins as a follower
//! and re-elects; durability lives in the result store.

pub mod message;
pub mod node;

pub use message::{
    HeartbeatMessage, Message, MessageType, ReplyVoteMessage, RequestVoteMessage,
};
pub use node::{Raft, RaftApp, RaftConfig, Role};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to publish: {0}")]
    Publish(#[from] pricemesh_network::NetworkError),
}
