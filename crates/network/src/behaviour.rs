//! Network behaviour for the oracle mesh
//!
//! Combines gossipsub (the round protocol transport), Kademlia and
//! identify for peer discovery, and mDNS for local networks.
//! Protocol names are parameterized by a prefix (e.g. "pricemesh").

use libp2p::{
    gossipsub, identify, kad, mdns,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
    PeerId, StreamProtocol,
};
use std::time::Duration;

/// Combined network behaviour for an oracle node.
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "MeshBehaviourEvent")]
pub struct MeshBehaviour {
    /// Gossipsub carries all aggregation and election traffic
    pub gossipsub: gossipsub::Behaviour,
    /// Kademlia DHT for peer discovery across the cluster
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    /// Identify protocol for peer info exchange
    pub identify: identify::Behaviour,
    /// mDNS for local network discovery (disabled via Toggle when not needed)
    pub mdns: Toggle<mdns::tokio::Behaviour>,
}

/// Events emitted by MeshBehaviour
#[derive(Debug)]
pub enum MeshBehaviourEvent {
    Gossipsub(gossipsub::Event),
    Kademlia(kad::Event),
    Identify(identify::Event),
    Mdns(mdns::Event),
}

impl From<gossipsub::Event> for MeshBehaviourEvent {
    fn from(e: gossipsub::Event) -> Self {
        MeshBehaviourEvent::Gossipsub(e)
    }
}

impl From<kad::Event> for MeshBehaviourEvent {
    fn from(e: kad::Event) -> Self {
        MeshBehaviourEvent::Kademlia(e)
    }
}

impl From<identify::Event> for MeshBehaviourEvent {
    fn from(e: identify::Event) -> Self {
        MeshBehaviourEvent::Identify(e)
    }
}

impl From<mdns::Event> for MeshBehaviourEvent {
    fn from(e: mdns::Event) -> Self {
        MeshBehaviourEvent::Mdns(e)
    }
}

impl MeshBehaviour {
    /// Build the behaviour stack with the given protocol prefix.
    ///
    /// Called from [`build_swarm`](crate::node::build_swarm) inside the
    /// SwarmBuilder callback. mDNS is optional so tests can isolate swarms.
    pub fn build(
        protocol_prefix: &str,
        local_peer_id: PeerId,
        keypair: &libp2p::identity::Keypair,
        enable_mdns: bool,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        // Gossipsub: signed messages so the sender identity is attested
        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(Duration::from_secs(1))
            .validation_mode(gossipsub::ValidationMode::Strict)
            .message_id_fn(|msg: &gossipsub::Message| {
                use std::hash::{Hash, Hasher};
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                msg.data.hash(&mut hasher);
                if let Some(peer) = &msg.source {
                    Hash::hash(peer, &mut hasher);
                }
                msg.sequence_number.hash(&mut hasher);
                gossipsub::MessageId::from(hasher.finish().to_be_bytes().to_vec())
            })
            .build()
            .map_err(|e| format!("gossipsub config: {}", e))?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossipsub_config,
        )
        .map_err(|e| format!("gossipsub behaviour: {}", e))?;

        // Kademlia
        let kad_protocol =
            StreamProtocol::try_from_owned(format!("/{}/kad/1.0.0", protocol_prefix))?;
        let mut kad_config = kad::Config::new(kad_protocol);
        kad_config.set_query_timeout(Duration::from_secs(60));
        let store = kad::store::MemoryStore::new(local_peer_id);
        let mut kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);
        // Server mode: respond to FIND_NODE from other peers so routing
        // tables fill even on small clusters.
        kademlia.set_mode(Some(kad::Mode::Server));

        // Identify
        let identify_config = identify::Config::new(
            format!("/{}/id/1.0.0", protocol_prefix),
            keypair.public(),
        )
        .with_agent_version(format!("{}/{}", protocol_prefix, env!("CARGO_PKG_VERSION")));
        let identify = identify::Behaviour::new(identify_config);

        // mDNS
        let mdns = if enable_mdns {
            Toggle::from(Some(mdns::tokio::Behaviour::new(
                mdns::Config::default(),
                local_peer_id,
            )?))
        } else {
            Toggle::from(None)
        };

        Ok(Self {
            gossipsub,
            kademlia,
            identify,
            mdns,
        })
    }

    /// Add a known peer address to the Kademlia routing table.
    pub fn add_address(&mut self, peer_id: &PeerId, addr: libp2p::Multiaddr) {
        self.kademlia.add_address(peer_id, addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_conversions() {
        // Verify From impls compile
        fn _gossip(e: gossipsub::Event) -> MeshBehaviourEvent {
            e.into()
        }
        fn _kad(e: kad::Event) -> MeshBehaviourEvent {
            e.into()
        }
        fn _id(e: identify::Event) -> MeshBehaviourEvent {
            e.into()
        }
        fn _mdns(e: mdns::Event) -> MeshBehaviourEvent {
            e.into()
        }
    }

    #[test]
    fn test_build_without_mdns() {
        let keypair = libp2p::identity::Keypair::generate_ed25519();
        let peer_id = PeerId::from(keypair.public());
        let behaviour = MeshBehaviour::build("pricemesh", peer_id, &keypair, false).unwrap();
        assert!(!behaviour.mdns.is_enabled());
    }
}
