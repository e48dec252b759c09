//! End-to-end round protocol tests.
//!
//! Each test runs a real aggregator (raft loop included) against a
//! detached topic handle: published frames loop back to the dispatcher,
//! and remote peers are simulated by publishing envelopes with foreign
//! sender ids and inflating the topic's peer view. Long election
//! timeouts freeze the node as a follower so tests fully control
//! leadership through heartbeats.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use libp2p::PeerId;
use pricemesh_core::{GlobalAggregate, LocalAggregate, Proof, TopicConfig};
use pricemesh_crypto::{Signer, SigningKeypair};
use pricemesh_network::{GossipFrame, TopicHandle};
use pricemesh_raft::{HeartbeatMessage, Message, MessageType, RaftConfig};
use pricemesh_store::{LatestLocalAggregates, ResultStore};

use crate::aggregator::Aggregator;
use crate::messages::{PriceDataMessage, ProofMessage, TriggerMessage};
use crate::AggregatorError;

const CONFIG_ID: i32 = 7;
const LEADER: &str = "boss";

fn topic_config() -> TopicConfig {
    TopicConfig {
        id: CONFIG_ID,
        name: "test-pair".to_string(),
        aggregate_interval: 3000,
    }
}

/// Election timeouts beyond any test duration: the node stays a
/// follower unless the test elects it via the fast config.
fn frozen_raft() -> RaftConfig {
    RaftConfig {
        election_timeout_min: Duration::from_secs(60),
        election_timeout_max: Duration::from_secs(120),
        heartbeat_interval: Duration::from_millis(20),
    }
}

fn fast_raft() -> RaftConfig {
    RaftConfig {
        election_timeout_min: Duration::from_millis(50),
        election_timeout_max: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(20),
    }
}

struct Harness {
    aggregator: Arc<Aggregator>,
    handle: TopicHandle,
    latest: Arc<LatestLocalAggregates>,
    results: Arc<ResultStore>,
    signer: Arc<Signer>,
    cancel: CancellationToken,
    _fatal_rx: mpsc::UnboundedReceiver<AggregatorError>,
    _dir: tempfile::TempDir,
}

impl Harness {
    /// The aggregator node's own identity on the topic.
    fn self_id(&self) -> String {
        self.handle.local_peer_id().to_string()
    }

    fn publish<T: Serialize>(&self, message_type: MessageType, from: &str, inner: &T) {
        let envelope = Message::new(message_type, from, inner).unwrap();
        self.handle
            .publish(serde_json::to_vec(&envelope).unwrap())
            .unwrap();
    }

    fn announce_leader(&self, term: u64) {
        self.publish(
            MessageType::Heartbeat,
            LEADER,
            &HeartbeatMessage {
                leader_id: LEADER.to_string(),
                term,
            },
        );
    }

    fn trigger(&self, round_id: i32) {
        self.publish(
            MessageType::Trigger,
            LEADER,
            &TriggerMessage {
                leader_id: LEADER.to_string(),
                round_id,
                timestamp: Utc::now(),
            },
        );
    }

    fn peer_price(&self, from: &str, round_id: i32, value: i64) {
        self.publish(
            MessageType::PriceData,
            from,
            &PriceDataMessage {
                round_id,
                price_data: value,
                timestamp: Utc::now(),
            },
        );
    }

    fn peer_proof(&self, from: &str, round_id: i32, value: i64, proof: Vec<u8>) {
        self.publish(
            MessageType::Proof,
            from,
            &ProofMessage {
                round_id,
                value,
                proof,
                timestamp: Utc::now(),
            },
        );
    }
}

async fn harness_with(
    peer_count: usize,
    raft_config: RaftConfig,
    interval_ms: i32,
    seed: Option<(GlobalAggregate, Proof)>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let results = Arc::new(ResultStore::open(dir.path().join("results")).unwrap());
    if let Some((global, proof)) = seed {
        results.write_submission(&global, &proof).unwrap();
    }
    let latest = Arc::new(LatestLocalAggregates::new());
    let signer = Arc::new(Signer::new(SigningKeypair::generate()));

    let handle = TopicHandle::detached("agg-harness");
    let peers: Vec<PeerId> = (0..peer_count).map(|_| PeerId::random()).collect();
    handle
        .peer_view()
        .set_topic_peers(handle.hash().clone(), peers);

    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
    let mut config = topic_config();
    config.aggregate_interval = interval_ms;
    let aggregator = Aggregator::new(
        config,
        handle.clone(),
        raft_config,
        signer.clone(),
        latest.clone(),
        results.clone(),
        fatal_tx,
    )
    .unwrap();

    let cancel = CancellationToken::new();
    aggregator.start(&cancel);
    // Let the dispatch worker subscribe before any frames fly.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        aggregator,
        handle,
        latest,
        results,
        signer,
        cancel,
        _fatal_rx: fatal_rx,
        _dir: dir,
    }
}

async fn harness(peer_count: usize, raft_config: RaftConfig) -> Harness {
    harness_with(peer_count, raft_config, 3000, None).await
}

/// Await the next frame of the given type published by `from`.
async fn await_frame(
    rx: &mut broadcast::Receiver<GossipFrame>,
    message_type: MessageType,
    from: &str,
) -> Message {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let frame = timeout(remaining, rx.recv())
            .await
            .expect("frame within deadline")
            .expect("channel open");
        if let Ok(message) = serde_json::from_slice::<Message>(&frame.data) {
            if message.message_type == message_type && message.sent_from == from {
                return message;
            }
        }
    }
}

/// Assert no frame of the given type from `from` arrives within the window.
async fn assert_no_frame(
    rx: &mut broadcast::Receiver<GossipFrame>,
    message_type: MessageType,
    from: &str,
    window: Duration,
) {
    let deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        match timeout(remaining, rx.recv()).await {
            Err(_) => return,
            Ok(frame) => {
                let frame = frame.expect("channel open");
                if let Ok(message) = serde_json::from_slice::<Message>(&frame.data) {
                    assert!(
                        !(message.message_type == message_type && message.sent_from == from),
                        "unexpected {:?} from {}",
                        message_type,
                        from
                    );
                }
            }
        }
    }
}

async fn await_write(results: &ResultStore, config_id: i32) -> GlobalAggregate {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(global) = results.latest_global(config_id).unwrap() {
            return global;
        }
        assert!(Instant::now() < deadline, "no result row written");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn fresh_local(value: i64) -> LocalAggregate {
    LocalAggregate {
        config_id: CONFIG_ID,
        value,
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn test_three_node_round_finalizes_median() {
    let h = harness(2, frozen_raft()).await;
    h.latest.store(CONFIG_ID, fresh_local(100));
    let mut rx = h.handle.subscribe();
    let self_id = h.self_id();

    h.announce_leader(1);
    h.trigger(1);

    // The node answers the trigger with its fresh local value.
    let price_env = await_frame(&mut rx, MessageType::PriceData, &self_id).await;
    let price: PriceDataMessage = serde_json::from_value(price_env.data).unwrap();
    assert_eq!(price.round_id, 1);
    assert_eq!(price.price_data, 100);

    // Second submission crosses the majority of three; the collected set
    // at lock time is {100, 104}, median picks the lower middle.
    h.peer_price("peer-b", 1, 104);
    let proof_env = await_frame(&mut rx, MessageType::Proof, &self_id).await;
    let own_proof: ProofMessage = serde_json::from_value(proof_env.data).unwrap();
    assert_eq!(own_proof.round_id, 1);
    assert_eq!(own_proof.value, 100);
    assert!(Signer::verify_aggregate(
        &h.signer.public_key_bytes(),
        CONFIG_ID,
        1,
        100,
        &own_proof.timestamp,
        &own_proof.proof
    ));

    // A late third price is ignored by the locked round.
    h.peer_price("peer-c", 1, 110);

    // Second proof crosses the proof quorum and persists the pair.
    let peer_sig = vec![9u8; 64];
    h.peer_proof("peer-b", 1, 100, peer_sig.clone());

    let written = await_write(&h.results, CONFIG_ID).await;
    assert_eq!(written.round, 1);
    assert_eq!(written.value, 100);
    assert_eq!(h.results.round_count(CONFIG_ID), 1);

    // Concatenation is sorted by sender id, identical on every writer.
    let submission = h.results.submission(CONFIG_ID, 1).unwrap().unwrap();
    let mut expected = vec![
        (self_id.clone(), own_proof.proof.clone()),
        ("peer-b".to_string(), peer_sig),
    ];
    expected.sort_by(|a, b| a.0.cmp(&b.0));
    let expected_bytes: Vec<u8> = expected.into_iter().flat_map(|(_, sig)| sig).collect();
    assert_eq!(submission.proof.proof, expected_bytes);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_stale_local_reports_sentinel() {
    let h = harness(2, frozen_raft()).await;
    h.latest.store(CONFIG_ID, fresh_local(100));
    let mut rx = h.handle.subscribe();
    let self_id = h.self_id();

    h.announce_leader(1);

    // Round 1: fresh value reported.
    h.trigger(1);
    let price_env = await_frame(&mut rx, MessageType::PriceData, &self_id).await;
    let price: PriceDataMessage = serde_json::from_value(price_env.data).unwrap();
    assert_eq!(price.price_data, 100);

    // Round 2 without a fetcher update: same timestamp means stale, so
    // the node asks to be ignored.
    h.trigger(2);
    let price_env = await_frame(&mut rx, MessageType::PriceData, &self_id).await;
    let price: PriceDataMessage = serde_json::from_value(price_env.data).unwrap();
    assert_eq!(price.round_id, 2);
    assert_eq!(price.price_data, -1);

    // The sentinel is filtered out of the median: quorum {-1, 120}
    // aggregates to 120.
    h.peer_price("peer-b", 2, 120);
    let proof_env = await_frame(&mut rx, MessageType::Proof, &self_id).await;
    let proof: ProofMessage = serde_json::from_value(proof_env.data).unwrap();
    assert_eq!(proof.value, 120);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_replayed_price_counted_once() {
    // Five-node cluster: quorum is three.
    let h = harness(4, frozen_raft()).await;
    h.latest.store(CONFIG_ID, fresh_local(100));
    let mut rx = h.handle.subscribe();
    let self_id = h.self_id();

    h.announce_leader(1);
    h.trigger(1);
    let _ = await_frame(&mut rx, MessageType::PriceData, &self_id).await;

    // Duplicate submission from the same sender is dropped; only the
    // first counts toward quorum.
    h.peer_price("peer-b", 1, 200);
    h.peer_price("peer-b", 1, 200);
    assert_no_frame(
        &mut rx,
        MessageType::Proof,
        &self_id,
        Duration::from_millis(300),
    )
    .await;

    // Third distinct sender completes the quorum. If the replay had been
    // counted, the collected set would be {100, 200, 200} with median
    // 200 instead of {100, 200, 110} with median 110.
    h.peer_price("peer-c", 1, 110);
    let proof_env = await_frame(&mut rx, MessageType::Proof, &self_id).await;
    let proof: ProofMessage = serde_json::from_value(proof_env.data).unwrap();
    assert_eq!(proof.value, 110);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_replayed_trigger_answered_once() {
    let h = harness(2, frozen_raft()).await;
    h.latest.store(CONFIG_ID, fresh_local(100));
    let mut rx = h.handle.subscribe();
    let self_id = h.self_id();

    h.announce_leader(1);
    h.trigger(1);
    let _ = await_frame(&mut rx, MessageType::PriceData, &self_id).await;

    h.trigger(1);
    assert_no_frame(
        &mut rx,
        MessageType::PriceData,
        &self_id,
        Duration::from_millis(300),
    )
    .await;

    h.cancel.cancel();
}

#[tokio::test]
async fn test_replayed_proof_counted_once() {
    // Five-node cluster: proof quorum is three.
    let h = harness(4, frozen_raft()).await;
    h.latest.store(CONFIG_ID, fresh_local(100));
    let mut rx = h.handle.subscribe();
    let self_id = h.self_id();

    h.announce_leader(1);
    h.trigger(1);
    let _ = await_frame(&mut rx, MessageType::PriceData, &self_id).await;
    h.peer_price("peer-b", 1, 104);
    h.peer_price("peer-c", 1, 110);
    let proof_env = await_frame(&mut rx, MessageType::Proof, &self_id).await;
    let own_proof: ProofMessage = serde_json::from_value(proof_env.data).unwrap();

    // Own proof plus a duplicated peer proof stays below quorum.
    h.peer_proof("peer-b", 1, own_proof.value, vec![2u8; 64]);
    h.peer_proof("peer-b", 1, own_proof.value, vec![2u8; 64]);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.results.latest_global(CONFIG_ID).unwrap().is_none());

    // A distinct third signer finalizes the round exactly once.
    h.peer_proof("peer-c", 1, own_proof.value, vec![3u8; 64]);
    let written = await_write(&h.results, CONFIG_ID).await;
    assert_eq!(written.round, 1);
    assert_eq!(h.results.round_count(CONFIG_ID), 1);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_all_sentinel_round_writes_nothing() {
    let h = harness(2, frozen_raft()).await;
    // No local aggregate at all: this node reports the sentinel.
    let mut rx = h.handle.subscribe();
    let self_id = h.self_id();

    h.announce_leader(1);
    h.trigger(1);
    let price_env = await_frame(&mut rx, MessageType::PriceData, &self_id).await;
    let price: PriceDataMessage = serde_json::from_value(price_env.data).unwrap();
    assert_eq!(price.price_data, -1);

    h.peer_price("peer-b", 1, -1);
    assert_no_frame(
        &mut rx,
        MessageType::Proof,
        &self_id,
        Duration::from_millis(300),
    )
    .await;
    assert!(h.results.latest_global(CONFIG_ID).unwrap().is_none());

    h.cancel.cancel();
}

#[tokio::test]
async fn test_finalized_round_guard_ignores_old_triggers() {
    // The store already holds round 5 from a previous process life.
    let seed_global = GlobalAggregate {
        config_id: CONFIG_ID,
        value: 90,
        round: 5,
        timestamp: Utc::now(),
    };
    let seed_proof = Proof {
        config_id: CONFIG_ID,
        round: 5,
        proof: vec![1u8; 64],
    };
    let h = harness_with(2, frozen_raft(), 3000, Some((seed_global, seed_proof))).await;
    assert_eq!(h.aggregator.finalized_round(), 5);

    h.latest.store(CONFIG_ID, fresh_local(100));
    let mut rx = h.handle.subscribe();
    let self_id = h.self_id();

    h.announce_leader(2);

    // A regressed round id from a new leader is absorbed by the guard.
    h.trigger(5);
    assert_no_frame(
        &mut rx,
        MessageType::PriceData,
        &self_id,
        Duration::from_millis(300),
    )
    .await;

    // The next fresh round proceeds normally.
    h.trigger(6);
    let price_env = await_frame(&mut rx, MessageType::PriceData, &self_id).await;
    let price: PriceDataMessage = serde_json::from_value(price_env.data).unwrap();
    assert_eq!(price.round_id, 6);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_singleton_node_aggregates_alone() {
    // No peers, fast elections, 100 ms rounds: the node elects itself,
    // triggers, submits its own value, reaches both quorums of one, and
    // persists a single-signature proof.
    let h = harness_with(0, fast_raft(), 100, None).await;
    h.latest.store(CONFIG_ID, fresh_local(42));

    let written = await_write(&h.results, CONFIG_ID).await;
    assert_eq!(written.value, 42);
    assert!(written.round >= 1);

    let submission = h
        .results
        .submission(CONFIG_ID, written.round)
        .unwrap()
        .unwrap();
    assert_eq!(submission.proof.proof.len(), 64);
    assert!(Signer::verify_aggregate(
        &h.signer.public_key_bytes(),
        CONFIG_ID,
        written.round,
        42,
        &written.timestamp,
        &submission.proof.proof
    ));

    // Later rounds see the unchanged local timestamp and stay sentinel,
    // so exactly one row exists.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.results.round_count(CONFIG_ID), 1);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_undersubscribed_round_expires_unwritten() {
    // Five-node cluster, only this node and one peer respond: quorum of
    // three never forms and nothing is signed or written.
    let h = harness(4, frozen_raft()).await;
    h.latest.store(CONFIG_ID, fresh_local(100));
    let mut rx = h.handle.subscribe();
    let self_id = h.self_id();

    h.announce_leader(1);
    h.trigger(1);
    let _ = await_frame(&mut rx, MessageType::PriceData, &self_id).await;
    h.peer_price("peer-b", 1, 104);

    assert_no_frame(
        &mut rx,
        MessageType::Proof,
        &self_id,
        Duration::from_millis(400),
    )
    .await;
    assert!(h.results.latest_global(CONFIG_ID).unwrap().is_none());

    h.cancel.cancel();
}

#[tokio::test]
async fn test_staleness_sweep_reclaims_abandoned_rounds() {
    let h = harness(2, frozen_raft()).await;
    h.latest.store(CONFIG_ID, fresh_local(100));
    let mut rx = h.handle.subscribe();
    let self_id = h.self_id();

    h.announce_leader(1);

    // Round 1 collects one submission and stalls.
    h.trigger(1);
    let _ = await_frame(&mut rx, MessageType::PriceData, &self_id).await;
    let (triggers, prices, proofs) = h.aggregator.round_state();
    assert!(triggers.contains(1));
    assert!(prices.contains(1));

    // Round 5 completes; the sweep cutoff is 5 - K = 2.
    h.trigger(5);
    let _ = await_frame(&mut rx, MessageType::PriceData, &self_id).await;
    h.peer_price("peer-b", 5, 104);
    h.peer_price("peer-c", 5, 110);
    let proof_env = await_frame(&mut rx, MessageType::Proof, &self_id).await;
    let own_proof: ProofMessage = serde_json::from_value(proof_env.data).unwrap();
    h.peer_proof("peer-b", 5, own_proof.value, vec![2u8; 64]);

    let written = await_write(&h.results, CONFIG_ID).await;
    assert_eq!(written.round, 5);

    assert!(!triggers.contains(1));
    assert!(!prices.contains(1));
    assert!(triggers.contains(5));
    assert!(!proofs.contains(1));

    h.cancel.cancel();
}
