//! Application frames of the round protocol.
//!
//! Each is carried as the `data` of a raft envelope. Field names are the
//! wire contract shared by every node version, so they are pinned with
//! explicit renames.

use chrono::{DateTime, Utc};
use pricemesh_core::base64_bytes;
use serde::{Deserialize, Serialize};

/// Leader tick: opens a round and asks every node for its observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerMessage {
    #[serde(rename = "leaderID")]
    pub leader_id: String,
    #[serde(rename = "roundID")]
    pub round_id: i32,
    pub timestamp: DateTime<Utc>,
}

/// One node's observation for a round. `priceData` of -1 means "ignore
/// this sender this round".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceDataMessage {
    #[serde(rename = "roundID")]
    pub round_id: i32,
    #[serde(rename = "priceData")]
    pub price_data: i64,
    pub timestamp: DateTime<Utc>,
}

/// One node's signature over the round's median.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofMessage {
    #[serde(rename = "roundID")]
    pub round_id: i32,
    pub value: i64,
    #[serde(with = "base64_bytes")]
    pub proof: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_wire_fields() {
        let trigger = TriggerMessage {
            leader_id: "peer-a".to_string(),
            round_id: 12,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&trigger).unwrap();
        assert!(json.contains("\"leaderID\":\"peer-a\""));
        assert!(json.contains("\"roundID\":12"));
        assert!(json.contains("\"timestamp\":"));
    }

    #[test]
    fn test_price_data_sentinel_roundtrip() {
        let price = PriceDataMessage {
            round_id: 3,
            price_data: -1,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&price).unwrap();
        assert!(json.contains("\"priceData\":-1"));

        let back: PriceDataMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.price_data, -1);
        assert_eq!(back.round_id, 3);
    }

    #[test]
    fn test_proof_is_base64_on_wire() {
        let proof = ProofMessage {
            round_id: 1,
            value: 104,
            proof: vec![1, 2, 3, 4],
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&proof).unwrap();
        assert!(json.contains("\"proof\":\"AQIDBA==\""));

        let back: ProofMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.proof, vec![1, 2, 3, 4]);
        assert_eq!(back.value, 104);
    }
}
