//! Latest local aggregate per topic.
//!
//! Written by the fetcher subsystem at its own cadence, read by each
//! aggregator once per round. The lock is never held across I/O.

use std::collections::HashMap;

use parking_lot::RwLock;
use pricemesh_core::LocalAggregate;

#[derive(Default)]
pub struct LatestLocalAggregates {
    map: RwLock<HashMap<i32, LocalAggregate>>,
}

impl LatestLocalAggregates {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent local aggregate for a topic, if any has been
    /// produced yet.
    pub fn load(&self, config_id: i32) -> Option<LocalAggregate> {
        self.map.read().get(&config_id).copied()
    }

    /// Replace the latest aggregate for a topic.
    pub fn store(&self, config_id: i32, aggregate: LocalAggregate) {
        self.map.write().insert(config_id, aggregate);
    }
}
