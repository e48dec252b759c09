//! Supervisor owning one aggregator per configured topic.
//!
//! Listens on the control bus for admin commands: refresh reloads the
//! topic list from settings and rebuilds every aggregator; activate and
//! deactivate toggle single topics and survive refreshes; stop and start
//! control the whole app. All aggregators share the process signer, the
//! gossip handle, and both stores.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pricemesh_bus::{commands, Message as BusMessage, MessageResponse};
use pricemesh_core::TopicConfig;
use pricemesh_crypto::Signer;
use pricemesh_network::Gossip;
use pricemesh_raft::RaftConfig;
use pricemesh_settings::{NodeSettings, RaftTuning, Settings};
use pricemesh_store::{LatestLocalAggregates, ResultStore};

use crate::aggregator::Aggregator;
use crate::AggregatorError;

fn raft_config_from(tuning: &RaftTuning) -> RaftConfig {
    RaftConfig {
        election_timeout_min: Duration::from_millis(tuning.election_timeout_min_ms),
        election_timeout_max: Duration::from_millis(tuning.election_timeout_max_ms),
        heartbeat_interval: Duration::from_millis(tuning.heartbeat_ms),
    }
}

pub struct AggregatorApp {
    gossip: Gossip,
    signer: Arc<Signer>,
    latest_local: Arc<LatestLocalAggregates>,
    results: Arc<ResultStore>,
    settings_path: Option<PathBuf>,

    aggregators: Mutex<HashMap<i32, Arc<Aggregator>>>,
    topics: Mutex<Vec<TopicConfig>>,
    raft_config: Mutex<RaftConfig>,
    /// Topic ids the admin has switched off; kept across refreshes.
    deactivated: Mutex<HashSet<i32>>,
    running: AtomicBool,

    fatal_tx: mpsc::UnboundedSender<AggregatorError>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<AggregatorError>>>,
}

impl AggregatorApp {
    pub fn new(
        gossip: Gossip,
        signer: Arc<Signer>,
        latest_local: Arc<LatestLocalAggregates>,
        results: Arc<ResultStore>,
        settings_path: Option<PathBuf>,
    ) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Self {
            gossip,
            signer,
            latest_local,
            results,
            settings_path,
            aggregators: Mutex::new(HashMap::new()),
            topics: Mutex::new(Vec::new()),
            raft_config: Mutex::new(RaftConfig::default()),
            deactivated: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
        }
    }

    pub fn aggregator_count(&self) -> usize {
        self.aggregators.lock().len()
    }

    /// Run until cancelled, serving bus commands. A fatal aggregator
    /// error (persistent result store failure) stops everything and
    /// surfaces here.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        mut bus_rx: mpsc::Receiver<BusMessage>,
    ) -> Result<(), AggregatorError> {
        let Some(mut fatal_rx) = self.fatal_rx.lock().take() else {
            return Err(AggregatorError::AlreadyRunning);
        };

        self.start_all(&cancel).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop_all();
                    break;
                }
                message = bus_rx.recv() => match message {
                    Some(message) => self.handle_bus_message(message, &cancel).await,
                    None => {
                        self.stop_all();
                        break;
                    }
                },
                Some(e) = fatal_rx.recv() => {
                    error!(error = %e, "fatal aggregator error, shutting down app");
                    self.stop_all();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn handle_bus_message(&self, message: BusMessage, parent: &CancellationToken) {
        let command = message.content.command.clone();
        let result = match command.as_str() {
            commands::REFRESH_AGGREGATOR_APP => self.refresh(parent).await,
            commands::ACTIVATE_AGGREGATOR => match topic_id_param(&message.content.params) {
                Some(id) => self.activate(id, parent).await,
                None => Err(AggregatorError::InvalidParams("id".to_string())),
            },
            commands::DEACTIVATE_AGGREGATOR => match topic_id_param(&message.content.params) {
                Some(id) => self.deactivate(id),
                None => Err(AggregatorError::InvalidParams("id".to_string())),
            },
            commands::STOP_AGGREGATOR_APP => {
                self.stop_all();
                Ok(())
            }
            commands::START_AGGREGATOR_APP => self.start_all(parent).await,
            other => Err(AggregatorError::UnknownCommand(other.to_string())),
        };

        if let Err(ref e) = result {
            warn!(command = %command, from = %message.from, error = %e, "bus command failed");
        }
        if let Some(reply) = message.response {
            let response = match result {
                Ok(()) => MessageResponse::ok(),
                Err(e) => MessageResponse::err(e.to_string()),
            };
            let _ = reply.send(response);
        }
    }

    fn load_settings(&self) -> Result<NodeSettings, AggregatorError> {
        let settings: Settings<NodeSettings> =
            Settings::load_or_default(self.settings_path.as_deref())?;
        settings.config.validate()?;
        Ok(settings.config)
    }

    /// Start an aggregator for every configured, activated topic.
    async fn start_all(&self, parent: &CancellationToken) -> Result<(), AggregatorError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let settings = self.load_settings()?;
        self.running.store(true, Ordering::SeqCst);
        *self.raft_config.lock() = raft_config_from(&settings.raft);
        *self.topics.lock() = settings.topics.clone();

        for topic in settings.topics {
            if self.deactivated.lock().contains(&topic.id) {
                info!(topic = %topic.name, id = topic.id, "topic deactivated, skipping");
                continue;
            }
            self.spawn_aggregator(&topic, parent).await?;
        }
        info!(count = self.aggregator_count(), "aggregator app started");
        Ok(())
    }

    fn stop_all(&self) {
        let aggregators: Vec<_> = {
            let mut map = self.aggregators.lock();
            map.drain().map(|(_, aggregator)| aggregator).collect()
        };
        for aggregator in aggregators {
            aggregator.stop();
        }
        self.running.store(false, Ordering::SeqCst);
        info!("aggregator app stopped");
    }

    /// Stop everything, reload settings, rebuild, restart.
    async fn refresh(&self, parent: &CancellationToken) -> Result<(), AggregatorError> {
        info!("refreshing aggregator app");
        self.stop_all();
        self.start_all(parent).await
    }

    async fn activate(
        &self,
        id: i32,
        parent: &CancellationToken,
    ) -> Result<(), AggregatorError> {
        self.deactivated.lock().remove(&id);
        if !self.running.load(Ordering::SeqCst) || self.aggregators.lock().contains_key(&id) {
            return Ok(());
        }
        let topic = self
            .topics
            .lock()
            .iter()
            .find(|topic| topic.id == id)
            .cloned()
            .ok_or(AggregatorError::UnknownAggregator(id))?;
        self.spawn_aggregator(&topic, parent).await
    }

    fn deactivate(&self, id: i32) -> Result<(), AggregatorError> {
        let known = self.topics.lock().iter().any(|topic| topic.id == id);
        if !known {
            return Err(AggregatorError::UnknownAggregator(id));
        }
        self.deactivated.lock().insert(id);
        if let Some(aggregator) = self.aggregators.lock().remove(&id) {
            aggregator.stop();
        }
        Ok(())
    }

    async fn spawn_aggregator(
        &self,
        topic: &TopicConfig,
        parent: &CancellationToken,
    ) -> Result<(), AggregatorError> {
        let handle = self.gossip.join(&gossip_topic_name(topic)).await?;
        let raft_config = self.raft_config.lock().clone();
        let aggregator = Aggregator::new(
            topic.clone(),
            handle,
            raft_config,
            self.signer.clone(),
            self.latest_local.clone(),
            self.results.clone(),
            self.fatal_tx.clone(),
        )?;
        aggregator.start(parent);
        self.aggregators.lock().insert(topic.id, aggregator);
        Ok(())
    }
}

/// Gossip topic namespace for a configured aggregation topic.
fn gossip_topic_name(topic: &TopicConfig) -> String {
    format!("pricemesh/aggregator/{}", topic.name)
}

fn topic_id_param(params: &serde_json::Value) -> Option<i32> {
    params.get("id").and_then(|v| v.as_i64()).map(|v| v as i32)
}
