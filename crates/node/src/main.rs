//! pricemeshd - distributed price oracle daemon
//!
//! Wires the process together: keys, swarm, stores, the control bus,
//! and the aggregator app. The fetcher and submitter subsystems attach
//! through the latest-local store and the result store respectively.

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pricemesh_aggregator::AggregatorApp;
use pricemesh_bus::{commands, MessageBus};
use pricemesh_crypto::Signer;
use pricemesh_logging::LogLevel;
use pricemesh_network::{build_swarm, parse_bootstrap_addr, Gossip, NetworkConfig};
use pricemesh_store::{LatestLocalAggregates, ResultStore};

use config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    let _ = pricemesh_logging::try_init(LogLevel::from_verbose(config.verbose));

    info!("pricemeshd v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("node failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let data_dir = config
        .data_dir
        .clone()
        .unwrap_or_else(pricemesh_keystore::default_data_dir);

    // Two identities: the libp2p network key and the aggregate signer.
    let network_keypair = pricemesh_keystore::load_or_generate_network_keypair(
        &data_dir.join("keys").join("network.key"),
    )?;
    let signing_keypair = pricemesh_keystore::load_or_generate_keypair(
        &data_dir.join("keys").join("signing.key"),
    )?;
    let signer = Arc::new(Signer::new(signing_keypair));
    info!(
        "signer public key: {}",
        hex::encode(signer.public_key_bytes())
    );

    let mut bootstrap_peers = Vec::new();
    for addr in &config.bootstrap {
        bootstrap_peers.push(parse_bootstrap_addr(addr)?);
    }

    let mut listen_addrs = Vec::new();
    for addr in &config.listen {
        listen_addrs.push(addr.parse()?);
    }

    let network_config = NetworkConfig {
        protocol_prefix: "pricemesh".to_string(),
        listen_addrs,
        bootstrap_peers: bootstrap_peers.clone(),
        enable_mdns: !config.no_mdns,
    };
    let (swarm, local_peer_id) = build_swarm(network_keypair, network_config).await?;
    let gossip = Gossip::spawn(swarm);
    info!(peer_id = %local_peer_id, "gossip transport up");

    for (_, addr) in bootstrap_peers {
        gossip.dial(addr)?;
    }

    let results = Arc::new(ResultStore::open(data_dir.join("results"))?);
    // Written by the fetcher subsystem, read by the aggregators.
    let latest_local = Arc::new(LatestLocalAggregates::new());

    let bus = Arc::new(MessageBus::new(32));
    let bus_rx = bus.subscribe(commands::CHANNEL_AGGREGATOR);

    let app = AggregatorApp::new(
        gossip,
        signer,
        latest_local,
        results,
        config.config.clone(),
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    app.run(cancel, bus_rx).await?;
    info!("pricemeshd exited cleanly");
    Ok(())
}
