//! The per-topic aggregation state machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pricemesh_core::{
    median_i64, GlobalAggregate, Proof, TopicConfig, SENTINEL_IGNORE, STALENESS_K,
};
use pricemesh_crypto::Signer;
use pricemesh_network::TopicHandle;
use pricemesh_raft::{Message, MessageType, Raft, RaftApp, RaftConfig};
use pricemesh_store::{LatestLocalAggregates, ResultStore};

use crate::messages::{PriceDataMessage, ProofMessage, TriggerMessage};
use crate::rounds::{RoundPrices, RoundProofs, RoundTriggers, Submission};
use crate::AggregatorError;

/// One topic's aggregation node. Owns the topic's raft election and all
/// of its round state; shares the signer and both stores with the rest
/// of the process.
pub struct Aggregator {
    config: TopicConfig,
    raft: Arc<Raft>,
    signer: Arc<Signer>,
    latest_local: Arc<LatestLocalAggregates>,
    results: Arc<ResultStore>,

    round_triggers: RoundTriggers,
    round_prices: RoundPrices,
    round_proofs: RoundProofs,
    /// Medians this node computed and signed at price quorum, with their
    /// signing timestamps, pending proof quorum.
    round_medians: Mutex<HashMap<i32, (i64, chrono::DateTime<Utc>)>>,

    round_id: AtomicI32,
    last_finalized: AtomicI32,
    /// Timestamp of the local aggregate last reported in a round, for
    /// the freshness check.
    last_reported_local: Mutex<Option<chrono::DateTime<Utc>>>,

    is_running: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    fatal_tx: mpsc::UnboundedSender<AggregatorError>,
}

impl Aggregator {
    /// Build an aggregator for one topic. The round counter and the
    /// finalized-round guard seed from the result store so a restarted
    /// node never reopens rounds it already persisted.
    pub fn new(
        config: TopicConfig,
        handle: TopicHandle,
        raft_config: RaftConfig,
        signer: Arc<Signer>,
        latest_local: Arc<LatestLocalAggregates>,
        results: Arc<ResultStore>,
        fatal_tx: mpsc::UnboundedSender<AggregatorError>,
    ) -> Result<Arc<Self>, AggregatorError> {
        let finalized = results
            .latest_global(config.id)?
            .map(|global| global.round)
            .unwrap_or(0);
        let raft = Arc::new(Raft::new(handle, raft_config));

        Ok(Arc::new(Self {
            config,
            raft,
            signer,
            latest_local,
            results,
            round_triggers: RoundTriggers::default(),
            round_prices: RoundPrices::default(),
            round_proofs: RoundProofs::default(),
            round_medians: Mutex::new(HashMap::new()),
            round_id: AtomicI32::new(finalized),
            last_finalized: AtomicI32::new(finalized),
            last_reported_local: Mutex::new(None),
            is_running: AtomicBool::new(false),
            cancel: Mutex::new(None),
            fatal_tx,
        }))
    }

    /// Start the raft and dispatch workers under a child of `parent`.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = parent.child_token();
        *self.cancel.lock() = Some(token.clone());
        self.raft.set_leader_job_interval(Some(Duration::from_millis(
            self.config.aggregate_interval as u64,
        )));

        let raft = self.raft.clone();
        let app = self.clone();
        tokio::spawn(async move { raft.run(token, app).await });
        info!(topic = %self.config.name, id = self.config.id, "aggregator started");
    }

    /// Cancel the workers. Remaining round state is left to the
    /// staleness sweep.
    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        self.raft.set_leader_job_interval(None);
        self.is_running.store(false, Ordering::SeqCst);
        info!(topic = %self.config.name, id = self.config.id, "aggregator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    pub fn raft(&self) -> &Arc<Raft> {
        &self.raft
    }

    /// Highest round this node has persisted.
    pub fn finalized_round(&self) -> i32 {
        self.last_finalized.load(Ordering::SeqCst)
    }

    fn broadcast<T: Serialize>(&self, message_type: MessageType, inner: &T) {
        match Message::new(message_type, self.raft.id(), inner) {
            Ok(envelope) => {
                if let Err(e) = self.raft.publish_message(&envelope) {
                    warn!(topic = %self.config.name, error = %e, "publish failed");
                }
            }
            Err(e) => warn!(topic = %self.config.name, error = %e, "failed to encode frame"),
        }
    }

    fn on_trigger(&self, message: Message) {
        let trigger: TriggerMessage = match serde_json::from_value(message.data) {
            Ok(inner) => inner,
            Err(e) => {
                warn!(topic = %self.config.name, error = %e, "malformed trigger");
                return;
            }
        };

        match self.raft.leader_id() {
            Some(leader) if leader == message.sent_from => {}
            _ => {
                debug!(
                    topic = %self.config.name,
                    from = %message.sent_from,
                    "trigger from unexpected sender"
                );
                return;
            }
        }
        if trigger.round_id <= self.last_finalized.load(Ordering::SeqCst) {
            debug!(
                topic = %self.config.name,
                round = trigger.round_id,
                "trigger for finalized round"
            );
            return;
        }
        if !self.round_triggers.lock_once(trigger.round_id) {
            debug!(topic = %self.config.name, round = trigger.round_id, "replayed trigger");
            return;
        }

        // Adopt the leader's round counter so this node continues from a
        // current value if it is elected later.
        self.round_id.fetch_max(trigger.round_id, Ordering::SeqCst);

        let (value, timestamp) = match self.latest_local.load(self.config.id) {
            Some(local) => {
                let mut last = self.last_reported_local.lock();
                if (*last).map_or(false, |reported| reported == local.timestamp) {
                    debug!(
                        topic = %self.config.name,
                        round = trigger.round_id,
                        "local aggregate unchanged, reporting sentinel"
                    );
                    (SENTINEL_IGNORE, Utc::now())
                } else {
                    *last = Some(local.timestamp);
                    (local.value, local.timestamp)
                }
            }
            None => {
                debug!(
                    topic = %self.config.name,
                    round = trigger.round_id,
                    "no local aggregate yet, reporting sentinel"
                );
                (SENTINEL_IGNORE, Utc::now())
            }
        };

        let price = PriceDataMessage {
            round_id: trigger.round_id,
            price_data: value,
            timestamp,
        };
        self.broadcast(MessageType::PriceData, &price);
    }

    fn on_price(&self, message: Message) {
        let price: PriceDataMessage = match serde_json::from_value(message.data) {
            Ok(inner) => inner,
            Err(e) => {
                warn!(topic = %self.config.name, error = %e, "malformed price submission");
                return;
            }
        };

        if price.round_id <= self.last_finalized.load(Ordering::SeqCst) {
            debug!(
                topic = %self.config.name,
                round = price.round_id,
                "price for finalized round"
            );
            return;
        }

        let cluster = self.raft.cluster_size();
        match self.round_prices.submit(
            price.round_id,
            &message.sent_from,
            price.price_data,
            cluster,
        ) {
            Submission::Replay => {
                debug!(
                    topic = %self.config.name,
                    round = price.round_id,
                    sender = %message.sent_from,
                    "replayed price submission"
                );
            }
            Submission::Pending => {}
            Submission::Quorum(prices) => self.on_price_quorum(price.round_id, &prices),
        }
    }

    fn on_price_quorum(&self, round_id: i32, prices: &[i64]) {
        let filtered: Vec<i64> = prices
            .iter()
            .copied()
            .filter(|value| *value != SENTINEL_IGNORE)
            .collect();
        let Some(median) = median_i64(&filtered) else {
            debug!(
                topic = %self.config.name,
                round = round_id,
                "all submissions sentinel, abandoning round"
            );
            return;
        };

        let timestamp = Utc::now();
        match self
            .signer
            .sign_aggregate(self.config.id, round_id, median, &timestamp)
        {
            Ok(signature) => {
                self.round_medians.lock().insert(round_id, (median, timestamp));
                info!(
                    topic = %self.config.name,
                    round = round_id,
                    value = median,
                    submissions = prices.len(),
                    "price quorum reached"
                );
                let proof = ProofMessage {
                    round_id,
                    value: median,
                    proof: signature,
                    timestamp,
                };
                self.broadcast(MessageType::Proof, &proof);
            }
            Err(e) => {
                warn!(
                    topic = %self.config.name,
                    round = round_id,
                    error = %e,
                    "signer failed, abandoning round"
                );
            }
        }
    }

    async fn on_proof(&self, message: Message) {
        let proof: ProofMessage = match serde_json::from_value(message.data) {
            Ok(inner) => inner,
            Err(e) => {
                warn!(topic = %self.config.name, error = %e, "malformed proof");
                return;
            }
        };

        if proof.round_id <= self.last_finalized.load(Ordering::SeqCst) {
            debug!(
                topic = %self.config.name,
                round = proof.round_id,
                "proof for finalized round"
            );
            return;
        }

        let cluster = self.raft.cluster_size();
        match self
            .round_proofs
            .submit(proof.round_id, &message.sent_from, proof.proof, cluster)
        {
            Submission::Replay => {
                debug!(
                    topic = %self.config.name,
                    round = proof.round_id,
                    sender = %message.sent_from,
                    "replayed proof"
                );
            }
            Submission::Pending => {}
            Submission::Quorum(collected) => {
                self.finalize_round(proof.round_id, collected).await;
            }
        }
    }

    async fn finalize_round(&self, round_id: i32, collected: Vec<(String, Vec<u8>)>) {
        let Some((median, signed_at)) = self.round_medians.lock().get(&round_id).copied() else {
            // Proof quorum formed before this node saw a price quorum.
            // Without a locally computed median there is nothing safe to
            // persist; a peer that did observe both quorums writes the row.
            debug!(
                topic = %self.config.name,
                round = round_id,
                "proof quorum without local price quorum, not writing"
            );
            return;
        };

        let mut collected = collected;
        // Sorted by sender id so the concatenation is identical on every
        // writer.
        collected.sort_by(|a, b| a.0.cmp(&b.0));
        let concatenated: Vec<u8> = collected.into_iter().flat_map(|(_, sig)| sig).collect();

        // The row carries the timestamp the median was signed with, so
        // this node's signature in the proof verifies against the row.
        let global = GlobalAggregate {
            config_id: self.config.id,
            value: median,
            round: round_id,
            timestamp: signed_at,
        };
        let proof_row = Proof {
            config_id: self.config.id,
            round: round_id,
            proof: concatenated,
        };

        match self
            .results
            .write_submission_with_retry(&global, &proof_row)
            .await
        {
            Ok(inserted) => {
                info!(
                    topic = %self.config.name,
                    round = round_id,
                    value = median,
                    inserted,
                    "global aggregate finalized"
                );
                self.last_finalized.fetch_max(round_id, Ordering::SeqCst);
                self.sweep(round_id);
            }
            Err(e) => {
                error!(
                    topic = %self.config.name,
                    round = round_id,
                    error = %e,
                    "result store write failed"
                );
                let _ = self.fatal_tx.send(AggregatorError::Store(e));
            }
        }
    }

    /// Drop round state older than the staleness cutoff.
    fn sweep(&self, finalized_round: i32) {
        let cutoff = finalized_round - STALENESS_K;
        self.round_triggers.cleanup_through(cutoff);
        self.round_prices.cleanup_through(cutoff);
        self.round_proofs.cleanup_through(cutoff);
        self.round_medians.lock().retain(|round, _| *round > cutoff);
    }

    #[cfg(test)]
    pub(crate) fn round_state(&self) -> (&RoundTriggers, &RoundPrices, &RoundProofs) {
        (&self.round_triggers, &self.round_prices, &self.round_proofs)
    }
}

impl RaftApp for Aggregator {
    async fn handle_custom_message(&self, message: Message) {
        match message.message_type {
            MessageType::Trigger => self.on_trigger(message),
            MessageType::PriceData => self.on_price(message),
            MessageType::Proof => self.on_proof(message).await,
            other => {
                debug!(topic = %self.config.name, message_type = ?other, "unhandled frame type");
            }
        }
    }

    async fn leader_job(&self) {
        let round_id = self.round_id.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(topic = %self.config.name, round = round_id, "emitting round trigger");
        let trigger = TriggerMessage {
            leader_id: self.raft.id().to_string(),
            round_id,
            timestamp: Utc::now(),
        };
        self.broadcast(MessageType::Trigger, &trigger);
    }
}
