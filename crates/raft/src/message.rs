//! Wire envelope and election message types.
//!
//! Every frame on a topic is the JSON envelope
//! `{"type": tag, "sentFrom": peer-id, "data": inner}`. Election tags are
//! handled inside the raft loop; all other tags are passed to the
//! application upcall. Unrecognized tags decode to [`MessageType::Unknown`]
//! and are dropped, so newer nodes can ship new tags without breaking old
//! peers.

use serde::{Deserialize, Serialize};

/// Tag of a gossip frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "requestVote")]
    RequestVote,
    #[serde(rename = "replyVote")]
    ReplyVote,
    #[serde(rename = "trigger")]
    Trigger,
    #[serde(rename = "priceData")]
    PriceData,
    #[serde(rename = "proof")]
    Proof,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Whether this tag is consumed by the election loop itself.
    pub fn is_raft_internal(self) -> bool {
        matches!(
            self,
            MessageType::Heartbeat | MessageType::RequestVote | MessageType::ReplyVote
        )
    }
}

/// The envelope wrapping every frame on a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(rename = "sentFrom")]
    pub sent_from: String,
    pub data: serde_json::Value,
}

impl Message {
    pub fn new<T: Serialize>(
        message_type: MessageType,
        sent_from: &str,
        inner: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_type,
            sent_from: sent_from.to_string(),
            data: serde_json::to_value(inner)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    #[serde(rename = "leaderID")]
    pub leader_id: String,
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteMessage {
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyVoteMessage {
    #[serde(rename = "votedFor")]
    pub voted_for: String,
    pub term: u64,
}
