//! Election loop and message dispatch.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pricemesh_network::{GossipFrame, TopicHandle};

use crate::message::{
    HeartbeatMessage, Message, MessageType, ReplyVoteMessage, RequestVoteMessage,
};
use crate::RaftError;

/// Election role of this node for its topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Raft timing knobs.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
        }
    }
}

/// Application upcall invoked by the raft loop.
///
/// `handle_custom_message` receives every non-election frame on the topic,
/// including loopback copies of this node's own frames. `leader_job` fires
/// on the interval set via [`Raft::set_leader_job_interval`], on the leader
/// only. Both run on the dispatch worker; anything that would block longer
/// than a few milliseconds must await instead.
pub trait RaftApp: Send + Sync + 'static {
    fn handle_custom_message(&self, message: Message) -> impl Future<Output = ()> + Send;
    fn leader_job(&self) -> impl Future<Output = ()> + Send;
}

struct RaftState {
    role: Role,
    term: u64,
    leader_id: Option<String>,
    voted_for: Option<(u64, String)>,
    votes: HashSet<String>,
}

/// Per-topic election node. Owned by the aggregator for the topic; the
/// aggregator passes itself as the upcall when spawning [`Raft::run`].
pub struct Raft {
    id: String,
    handle: TopicHandle,
    config: RaftConfig,
    state: Mutex<RaftState>,
    leader_job_interval: Mutex<Option<Duration>>,
}

impl Raft {
    pub fn new(handle: TopicHandle, config: RaftConfig) -> Self {
        let id = handle.local_peer_id().to_string();
        Self {
            id,
            handle,
            config,
            state: Mutex::new(RaftState {
                role: Role::Follower,
                term: 0,
                leader_id: None,
                voted_for: None,
                votes: HashSet::new(),
            }),
            leader_job_interval: Mutex::new(None),
        }
    }

    /// This node's identity on the topic, as carried in envelopes.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    pub fn leader_id(&self) -> Option<String> {
        self.state.lock().leader_id.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == Role::Leader
    }

    /// Remote peers currently subscribed to the topic.
    pub fn peer_count(&self) -> usize {
        self.handle.peers().len()
    }

    /// Remote peers plus self. Quorums are majorities of this.
    pub fn cluster_size(&self) -> usize {
        self.peer_count() + 1
    }

    /// Set the leader-job cadence. Read once when `run` starts.
    pub fn set_leader_job_interval(&self, interval: Option<Duration>) {
        *self.leader_job_interval.lock() = interval;
    }

    /// Broadcast a message to the topic. Failure is non-fatal; gossip
    /// redundancy and the next round absorb individual losses.
    pub fn publish_message(&self, message: &Message) -> Result<(), RaftError> {
        let data = serde_json::to_vec(message)?;
        self.handle.publish(data)?;
        Ok(())
    }

    /// Drive the election loop until `cancel` fires.
    pub async fn run<A: RaftApp>(&self, cancel: CancellationToken, app: Arc<A>) {
        let mut frames = self.handle.subscribe();

        let election = time::sleep(self.random_election_timeout());
        tokio::pin!(election);

        let mut heartbeat = time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let leader_job_every = *self.leader_job_interval.lock();
        let mut leader_job =
            time::interval(leader_job_every.unwrap_or(Duration::from_secs(3600)));
        leader_job.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(id = %self.id, topic = %self.handle.name(), "raft node starting");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => {
                    match frame {
                        Ok(frame) => {
                            if self.on_frame(frame, app.as_ref()).await {
                                election.as_mut().reset(
                                    Instant::now() + self.random_election_timeout(),
                                );
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(dropped)) => {
                            warn!(dropped, topic = %self.handle.name(), "gossip reader lagging");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = &mut election, if !self.is_leader() => {
                    self.start_election();
                    election.as_mut().reset(Instant::now() + self.random_election_timeout());
                }
                _ = heartbeat.tick(), if self.is_leader() => {
                    self.send_heartbeat();
                }
                _ = leader_job.tick(), if self.is_leader() && leader_job_every.is_some() => {
                    app.leader_job().await;
                }
            }
        }

        info!(id = %self.id, topic = %self.handle.name(), "raft node stopped");
    }

    /// Returns whether the election timer should be reset.
    async fn on_frame<A: RaftApp>(&self, frame: GossipFrame, app: &A) -> bool {
        let message: Message = match serde_json::from_slice(&frame.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, topic = %self.handle.name(), "failed to decode gossip frame");
                return false;
            }
        };

        match message.message_type {
            MessageType::Heartbeat => self.on_heartbeat(&message),
            MessageType::RequestVote => self.on_request_vote(&message),
            MessageType::ReplyVote => self.on_reply_vote(&message),
            MessageType::Unknown => {
                debug!(from = %message.sent_from, "ignoring unknown message type");
                false
            }
            _ => {
                app.handle_custom_message(message).await;
                false
            }
        }
    }

    fn on_heartbeat(&self, message: &Message) -> bool {
        if message.sent_from == self.id {
            return false;
        }
        let heartbeat: HeartbeatMessage = match serde_json::from_value(message.data.clone()) {
            Ok(inner) => inner,
            Err(e) => {
                warn!(error = %e, "malformed heartbeat");
                return false;
            }
        };

        let mut state = self.state.lock();
        if heartbeat.term < state.term {
            debug!(term = heartbeat.term, own = state.term, "stale heartbeat");
            return false;
        }
        state.term = heartbeat.term;
        if state.role != Role::Follower {
            info!(
                id = %self.id,
                leader = %heartbeat.leader_id,
                term = heartbeat.term,
                "stepping down to follower"
            );
            state.role = Role::Follower;
            state.votes.clear();
        }
        state.leader_id = Some(heartbeat.leader_id);
        true
    }

    fn on_request_vote(&self, message: &Message) -> bool {
        if message.sent_from == self.id {
            return false;
        }
        let request: RequestVoteMessage = match serde_json::from_value(message.data.clone()) {
            Ok(inner) => inner,
            Err(e) => {
                warn!(error = %e, "malformed vote request");
                return false;
            }
        };

        let granted = {
            let mut state = self.state.lock();
            // One vote per term: granting requires a strictly newer term.
            if request.term > state.term {
                state.term = request.term;
                if state.role != Role::Follower {
                    state.role = Role::Follower;
                    state.votes.clear();
                }
                state.leader_id = None;
                state.voted_for = Some((request.term, message.sent_from.clone()));
                true
            } else {
                false
            }
        };

        if granted {
            debug!(candidate = %message.sent_from, term = request.term, "vote granted");
            let reply = ReplyVoteMessage {
                voted_for: message.sent_from.clone(),
                term: request.term,
            };
            match Message::new(MessageType::ReplyVote, &self.id, &reply) {
                Ok(envelope) => {
                    if let Err(e) = self.publish_message(&envelope) {
                        debug!(error = %e, "vote reply publish failed");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode vote reply"),
            }
        } else {
            debug!(candidate = %message.sent_from, term = request.term, "vote request ignored");
        }
        granted
    }

    fn on_reply_vote(&self, message: &Message) -> bool {
        if message.sent_from == self.id {
            return false;
        }
        let reply: ReplyVoteMessage = match serde_json::from_value(message.data.clone()) {
            Ok(inner) => inner,
            Err(e) => {
                warn!(error = %e, "malformed vote reply");
                return false;
            }
        };

        let won = {
            let mut state = self.state.lock();
            if state.role != Role::Candidate
                || reply.term != state.term
                || reply.voted_for != self.id
            {
                return false;
            }
            state.votes.insert(message.sent_from.clone());
            if state.votes.len() * 2 > self.cluster_size() {
                state.role = Role::Leader;
                state.leader_id = Some(self.id.clone());
                info!(
                    id = %self.id,
                    term = state.term,
                    votes = state.votes.len(),
                    "elected leader"
                );
                true
            } else {
                false
            }
        };

        if won {
            self.send_heartbeat();
        }
        won
    }

    fn start_election(&self) {
        let publish_term = {
            let mut state = self.state.lock();
            state.role = Role::Candidate;
            state.term += 1;
            state.leader_id = None;
            state.voted_for = Some((state.term, self.id.clone()));
            state.votes = HashSet::from([self.id.clone()]);
            if state.votes.len() * 2 > self.cluster_size() {
                state.role = Role::Leader;
                state.leader_id = Some(self.id.clone());
                info!(id = %self.id, term = state.term, "elected leader (singleton)");
                None
            } else {
                debug!(id = %self.id, term = state.term, "election started");
                Some(state.term)
            }
        };

        match publish_term {
            Some(term) => {
                let request = RequestVoteMessage { term };
                match Message::new(MessageType::RequestVote, &self.id, &request) {
                    Ok(envelope) => {
                        if let Err(e) = self.publish_message(&envelope) {
                            debug!(error = %e, "vote request publish failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode vote request"),
                }
            }
            None => self.send_heartbeat(),
        }
    }

    fn send_heartbeat(&self) {
        let heartbeat = {
            let state = self.state.lock();
            HeartbeatMessage {
                leader_id: self.id.clone(),
                term: state.term,
            }
        };
        match Message::new(MessageType::Heartbeat, &self.id, &heartbeat) {
            Ok(envelope) => {
                if let Err(e) = self.publish_message(&envelope) {
                    debug!(error = %e, "heartbeat publish failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode heartbeat"),
        }
    }

    fn random_election_timeout(&self) -> Duration {
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = self.config.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}
