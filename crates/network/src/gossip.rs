//! Topic-addressed publish/subscribe over the swarm.
//!
//! A single driver task owns the `Swarm`; applications hold a [`Gossip`]
//! handle and per-topic [`TopicHandle`]s that communicate with the driver
//! over a command channel. Delivery is best-effort and unordered across
//! senders. Published frames are looped back to local subscribers, so a
//! node always sees its own traffic, including with zero connected peers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic, TopicHash};
use libp2p::swarm::SwarmEvent;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::behaviour::MeshBehaviourEvent;
use crate::error::NetworkError;
use crate::node::MeshSwarm;

/// Frames delivered per topic. Lagging subscribers drop oldest frames,
/// matching the transport's best-effort contract.
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// One frame received on a topic. `source` is the transport-attested
/// identity of the publishing peer.
#[derive(Debug, Clone)]
pub struct GossipFrame {
    pub source: PeerId,
    pub data: Vec<u8>,
}

/// Current subscriber sets per topic, maintained by the driver from
/// gossipsub subscription events. Shared with topic handles so quorum
/// math can read the peer view without crossing the driver.
#[derive(Default)]
pub struct PeerView {
    inner: RwLock<HashMap<TopicHash, HashSet<PeerId>>>,
}

impl PeerView {
    pub fn peers_of(&self, topic: &TopicHash) -> Vec<PeerId> {
        self.inner
            .read()
            .get(topic)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Replace the subscriber set for a topic. Used by the driver and by
    /// tests that run against detached handles.
    pub fn set_topic_peers(&self, topic: TopicHash, peers: Vec<PeerId>) {
        self.inner.write().insert(topic, peers.into_iter().collect());
    }

    fn add(&self, topic: &TopicHash, peer: PeerId) {
        self.inner.write().entry(topic.clone()).or_default().insert(peer);
    }

    fn remove(&self, topic: &TopicHash, peer: &PeerId) {
        if let Some(set) = self.inner.write().get_mut(topic) {
            set.remove(peer);
        }
    }

    fn remove_everywhere(&self, peer: &PeerId) {
        for set in self.inner.write().values_mut() {
            set.remove(peer);
        }
    }
}

enum SwarmCommand {
    Join {
        name: String,
        reply: oneshot::Sender<Result<(broadcast::Sender<GossipFrame>, TopicHash), NetworkError>>,
    },
    Publish {
        hash: TopicHash,
        data: Vec<u8>,
    },
    Dial(Multiaddr),
    ConnectedPeers(oneshot::Sender<Vec<PeerId>>),
}

/// Handle to one joined gossip topic.
#[derive(Clone)]
pub struct TopicHandle {
    name: String,
    hash: TopicHash,
    frames: broadcast::Sender<GossipFrame>,
    cmd_tx: Option<mpsc::UnboundedSender<SwarmCommand>>,
    peer_view: Arc<PeerView>,
    local_peer_id: PeerId,
}

impl TopicHandle {
    /// Publish a frame to the topic. Best effort: the driver logs and
    /// drops on gossipsub errors, and local subscribers always receive
    /// the loopback copy.
    pub fn publish(&self, data: Vec<u8>) -> Result<(), NetworkError> {
        match &self.cmd_tx {
            Some(tx) => tx
                .send(SwarmCommand::Publish {
                    hash: self.hash.clone(),
                    data,
                })
                .map_err(|_| NetworkError::DriverClosed),
            None => {
                // Detached handle: loopback only.
                let _ = self.frames.send(GossipFrame {
                    source: self.local_peer_id,
                    data,
                });
                Ok(())
            }
        }
    }

    /// Subscribe to the topic's frame stream.
    pub fn subscribe(&self) -> broadcast::Receiver<GossipFrame> {
        self.frames.subscribe()
    }

    /// The current remote subscriber set for this topic.
    pub fn peers(&self) -> Vec<PeerId> {
        self.peer_view.peers_of(&self.hash)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> &TopicHash {
        &self.hash
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn peer_view(&self) -> &Arc<PeerView> {
        &self.peer_view
    }

    /// A handle with no swarm behind it: publishes loop straight back to
    /// subscribers. Used to exercise protocol logic without a network.
    pub fn detached(name: &str) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self {
            name: name.to_string(),
            hash: IdentTopic::new(name).hash(),
            frames,
            cmd_tx: None,
            peer_view: Arc::new(PeerView::default()),
            local_peer_id: PeerId::random(),
        }
    }
}

/// Handle to the swarm driver task.
#[derive(Clone)]
pub struct Gossip {
    cmd_tx: mpsc::UnboundedSender<SwarmCommand>,
    peer_view: Arc<PeerView>,
    local_peer_id: PeerId,
}

impl Gossip {
    /// Take ownership of the swarm and spawn the driver task.
    pub fn spawn(swarm: MeshSwarm) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let peer_view = Arc::new(PeerView::default());
        let local_peer_id = *swarm.local_peer_id();

        let driver = SwarmDriver {
            swarm,
            cmd_rx,
            topics: HashMap::new(),
            peer_view: peer_view.clone(),
        };
        tokio::spawn(driver.run());

        Self {
            cmd_tx,
            peer_view,
            local_peer_id,
        }
    }

    /// Join a topic, subscribing the swarm and returning a handle.
    pub async fn join(&self, name: &str) -> Result<TopicHandle, NetworkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::Join {
                name: name.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| NetworkError::DriverClosed)?;
        let (frames, hash) = reply_rx.await.map_err(|_| NetworkError::DriverClosed)??;
        Ok(TopicHandle {
            name: name.to_string(),
            hash,
            frames,
            cmd_tx: Some(self.cmd_tx.clone()),
            peer_view: self.peer_view.clone(),
            local_peer_id: self.local_peer_id,
        })
    }

    /// Dial a remote address (bootstrap).
    pub fn dial(&self, addr: Multiaddr) -> Result<(), NetworkError> {
        self.cmd_tx
            .send(SwarmCommand::Dial(addr))
            .map_err(|_| NetworkError::DriverClosed)
    }

    /// All currently connected peers.
    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, NetworkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::ConnectedPeers(reply_tx))
            .map_err(|_| NetworkError::DriverClosed)?;
        reply_rx.await.map_err(|_| NetworkError::DriverClosed)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }
}

struct SwarmDriver {
    swarm: MeshSwarm,
    cmd_rx: mpsc::UnboundedReceiver<SwarmCommand>,
    topics: HashMap<TopicHash, broadcast::Sender<GossipFrame>>,
    peer_view: Arc<PeerView>,
}

impl SwarmDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.on_command(cmd),
                        None => {
                            debug!("all gossip handles dropped, stopping driver");
                            break;
                        }
                    }
                }
                event = self.swarm.select_next_some() => {
                    self.on_swarm_event(event);
                }
            }
        }
    }

    fn on_command(&mut self, cmd: SwarmCommand) {
        match cmd {
            SwarmCommand::Join { name, reply } => {
                let topic = IdentTopic::new(&name);
                let hash = topic.hash();
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&topic)
                    .map_err(|e| NetworkError::SubscribeError(e.to_string()))
                    .map(|_| {
                        let sender = self
                            .topics
                            .entry(hash.clone())
                            .or_insert_with(|| {
                                broadcast::channel(FRAME_CHANNEL_CAPACITY).0
                            })
                            .clone();
                        info!(topic = %name, "joined gossip topic");
                        (sender, hash)
                    });
                let _ = reply.send(result);
            }
            SwarmCommand::Publish { hash, data } => {
                match self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(hash.clone(), data.clone())
                {
                    Ok(_) => {}
                    Err(gossipsub::PublishError::InsufficientPeers) => {
                        debug!(topic = %hash, "publish with no peers, loopback only");
                    }
                    Err(e) => warn!(topic = %hash, error = %e, "gossipsub publish failed"),
                }
                // Loopback so the node participates in its own rounds.
                if let Some(sender) = self.topics.get(&hash) {
                    let _ = sender.send(GossipFrame {
                        source: *self.swarm.local_peer_id(),
                        data,
                    });
                }
            }
            SwarmCommand::Dial(addr) => {
                if let Err(e) = self.swarm.dial(addr.clone()) {
                    warn!(address = %addr, error = %e, "dial failed");
                }
            }
            SwarmCommand::ConnectedPeers(reply) => {
                let peers = self.swarm.connected_peers().copied().collect();
                let _ = reply.send(peers);
            }
        }
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<MeshBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(MeshBehaviourEvent::Gossipsub(event)) => {
                self.on_gossipsub_event(event)
            }
            SwarmEvent::Behaviour(MeshBehaviourEvent::Mdns(event)) => match event {
                libp2p::mdns::Event::Discovered(list) => {
                    for (peer_id, addr) in list {
                        debug!(peer = %peer_id, "mdns discovered peer");
                        self.swarm.behaviour_mut().add_address(&peer_id, addr);
                        let _ = self.swarm.dial(peer_id);
                    }
                }
                libp2p::mdns::Event::Expired(_) => {}
            },
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(address = %address, "listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!(peer = %peer_id, "connection established");
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    debug!(peer = %peer_id, "peer disconnected");
                    self.peer_view.remove_everywhere(&peer_id);
                }
            }
            _ => {}
        }
    }

    fn on_gossipsub_event(&mut self, event: gossipsub::Event) {
        match event {
            gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            } => {
                let source = match message.source {
                    Some(peer) => peer,
                    // Strict validation signs every message; an unsigned
                    // frame reaching this point is a misbehaving peer.
                    None => {
                        warn!(via = %propagation_source, "dropping unsigned gossip message");
                        return;
                    }
                };
                if let Some(sender) = self.topics.get(&message.topic) {
                    let _ = sender.send(GossipFrame {
                        source,
                        data: message.data,
                    });
                } else {
                    debug!(topic = %message.topic, "message for unjoined topic");
                }
            }
            gossipsub::Event::Subscribed { peer_id, topic } => {
                debug!(peer = %peer_id, topic = %topic, "peer subscribed");
                self.peer_view.add(&topic, peer_id);
            }
            gossipsub::Event::Unsubscribed { peer_id, topic } => {
                debug!(peer = %peer_id, topic = %topic, "peer unsubscribed");
                self.peer_view.remove(&topic, &peer_id);
            }
            _ => {}
        }
    }
}
