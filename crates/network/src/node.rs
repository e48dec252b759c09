//! Swarm builder
//!
//! Builds a libp2p swarm with the oracle behaviour stack.
//! Protocol names are parameterized by the `protocol_prefix` in [`NetworkConfig`].

use libp2p::{identity::Keypair, noise, tcp, yamux, Multiaddr, PeerId, SwarmBuilder};
use tracing::info;

use crate::behaviour::MeshBehaviour;
use crate::error::NetworkError;

/// Type alias for a swarm using the oracle MeshBehaviour.
pub type MeshSwarm = libp2p::Swarm<MeshBehaviour>;

/// Network configuration for building a swarm.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Protocol prefix for Kademlia, identify, etc.
    /// E.g. `"pricemesh"` yields `/pricemesh/kad/1.0.0`.
    pub protocol_prefix: String,
    /// Addresses to listen on.
    pub listen_addrs: Vec<Multiaddr>,
    /// Bootstrap peers to add to the routing table on startup.
    pub bootstrap_peers: Vec<(PeerId, Multiaddr)>,
    /// Whether to run mDNS discovery. Disabled in tests to prevent
    /// cross-test peer discovery.
    pub enable_mdns: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            protocol_prefix: "pricemesh".to_string(),
            listen_addrs: vec!["/ip4/0.0.0.0/tcp/0".parse().expect("valid multiaddr")],
            bootstrap_peers: Vec::new(),
            enable_mdns: true,
        }
    }
}

/// Build a libp2p swarm with the full MeshBehaviour stack.
///
/// Returns `(swarm, local_peer_id)`. The swarm is already listening on
/// `config.listen_addrs` and has bootstrap peers added to Kademlia.
pub async fn build_swarm(
    keypair: Keypair,
    config: NetworkConfig,
) -> Result<(MeshSwarm, PeerId), NetworkError> {
    let local_peer_id = PeerId::from(keypair.public());
    info!("local peer id: {}", local_peer_id);

    let protocol_prefix = config.protocol_prefix.clone();
    let enable_mdns = config.enable_mdns;

    let mut swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| NetworkError::SwarmBuildError(e.to_string()))?
        .with_behaviour(|key| {
            let peer_id = PeerId::from(key.public());
            MeshBehaviour::build(&protocol_prefix, peer_id, key, enable_mdns)
        })
        .map_err(|e| NetworkError::SwarmBuildError(format!("{:?}", e)))?
        .with_swarm_config(|c| {
            c.with_idle_connection_timeout(std::time::Duration::from_secs(300))
        })
        .build();

    for addr in config.listen_addrs {
        swarm
            .listen_on(addr)
            .map_err(|e| NetworkError::ListenError(e.to_string()))?;
    }

    for (peer_id, addr) in config.bootstrap_peers {
        swarm.behaviour_mut().add_address(&peer_id, addr);
    }

    Ok((swarm, local_peer_id))
}
