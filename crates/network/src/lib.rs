//! PriceMesh Network
//!
//! libp2p networking stack for the oracle cluster. Provides:
//! - Swarm builder with gossipsub, Kademlia, identify, and mDNS
//! - A driver task owning the swarm, commanded over a channel
//! - Topic handles: join, publish, subscribe, peer view
//! - Bootstrap address parsing
//!
//! Published frames are looped back to local subscribers so a node
//! participates in its own topics, including as a singleton cluster.

pub mod behaviour;
pub mod bootstrap;
pub mod error;
pub mod gossip;
pub mod node;

pub use behaviour::MeshBehaviour;
pub use bootstrap::parse_bootstrap_addr;
pub use error::NetworkError;
pub use gossip::{Gossip, GossipFrame, PeerView, TopicHandle};
pub use node::{build_swarm, MeshSwarm, NetworkConfig};

/// Re-export libp2p types commonly used by pricemesh crates
pub use libp2p::gossipsub::TopicHash;
pub use libp2p::{Multiaddr, PeerId};
