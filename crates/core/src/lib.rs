//! PriceMesh Core
//!
//! Domain types and constants shared by all PriceMesh crates.
//! No dependency on networking, storage, or crypto.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved price value meaning "this peer has no fresh observation this round".
pub const SENTINEL_IGNORE: i64 = -1;

/// Round-state entries older than `current round - STALENESS_K` are swept.
pub const STALENESS_K: i32 = 3;

/// Default per-topic aggregation interval in milliseconds.
pub const DEFAULT_AGGREGATE_INTERVAL_MS: i32 = 3000;

/// Smallest aggregation interval a topic may configure.
pub const MIN_AGGREGATE_INTERVAL_MS: i32 = 100;

/// A single aggregation topic: one independently elected cluster,
/// one stream of rounds, one row family in the result store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicConfig {
    pub id: i32,
    pub name: String,
    /// Round cadence in milliseconds. Must be at least
    /// [`MIN_AGGREGATE_INTERVAL_MS`]; omitted entries fall back to
    /// [`DEFAULT_AGGREGATE_INTERVAL_MS`].
    #[serde(default = "default_aggregate_interval")]
    pub aggregate_interval: i32,
}

fn default_aggregate_interval() -> i32 {
    DEFAULT_AGGREGATE_INTERVAL_MS
}

/// The most recent locally observed value for a topic, written by the
/// fetcher subsystem and read by the aggregator each round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalAggregate {
    pub config_id: i32,
    pub value: i64,
    pub timestamp: DateTime<Utc>,
}

/// A finalized cluster-wide value for one round of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalAggregate {
    pub config_id: i32,
    pub value: i64,
    pub round: i32,
    pub timestamp: DateTime<Utc>,
}

/// Concatenated peer signatures backing one [`GlobalAggregate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proof {
    pub config_id: i32,
    pub round: i32,
    #[serde(with = "base64_bytes")]
    pub proof: Vec<u8>,
}

/// A finalized aggregate paired with its proof, as consumed by the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionData {
    pub global_aggregate: GlobalAggregate,
    pub proof: Proof,
}

/// Median of the given values, lower-middle element for even counts.
/// Returns `None` for an empty slice.
pub fn median_i64(values: &[i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    Some(sorted[(sorted.len() - 1) / 2])
}

/// Serde helper encoding `Vec<u8>` as a base64 string on the wire.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
