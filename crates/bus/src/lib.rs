//! PriceMesh Bus
//!
//! In-process control bus connecting the admin surface to long-running
//! apps. Each app subscribes to a named channel; senders address messages
//! by channel name and receive a success/error response over a oneshot.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Well-known channel and command names.
pub mod commands {
    pub const CHANNEL_AGGREGATOR: &str = "aggregator";

    pub const REFRESH_AGGREGATOR_APP: &str = "refresh_aggregator_app";
    pub const ACTIVATE_AGGREGATOR: &str = "activate_aggregator";
    pub const DEACTIVATE_AGGREGATOR: &str = "deactivate_aggregator";
    pub const STOP_AGGREGATOR_APP: &str = "stop_aggregator_app";
    pub const START_AGGREGATOR_APP: &str = "start_aggregator_app";
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("no subscriber for channel {0}")]
    UnknownChannel(String),
    #[error("channel {0} closed")]
    ChannelClosed(String),
}

/// A command and its parameters.
#[derive(Debug, Clone)]
pub struct MessageContent {
    pub command: String,
    pub params: serde_json::Value,
}

/// Outcome reported back to the sender.
#[derive(Debug, Clone)]
pub struct MessageResponse {
    pub success: bool,
    pub error: Option<String>,
}

impl MessageResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// A bus message. `response` is taken by the receiving app to reply.
#[derive(Debug)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub content: MessageContent,
    pub response: Option<oneshot::Sender<MessageResponse>>,
}

/// The process-wide message bus.
pub struct MessageBus {
    channels: Mutex<HashMap<String, mpsc::Sender<Message>>>,
    capacity: usize,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Register a channel and return its receiving end. Subscribing a
    /// name again replaces the previous subscriber.
    pub fn subscribe(&self, channel: &str) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.channels.lock().insert(channel.to_string(), tx);
        rx
    }

    /// Deliver a message to its `to` channel.
    pub async fn send(&self, message: Message) -> Result<(), BusError> {
        let sender = self
            .channels
            .lock()
            .get(&message.to)
            .cloned()
            .ok_or_else(|| BusError::UnknownChannel(message.to.clone()))?;
        let channel = message.to.clone();
        sender
            .send(message)
            .await
            .map_err(|_| BusError::ChannelClosed(channel))
    }

    /// Send a command and await the app's response.
    pub async fn request(
        &self,
        from: &str,
        to: &str,
        command: &str,
        params: serde_json::Value,
    ) -> Result<MessageResponse, BusError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(Message {
            from: from.to_string(),
            to: to.to_string(),
            content: MessageContent {
                command: command.to_string(),
                params,
            },
            response: Some(response_tx),
        })
        .await?;
        response_rx
            .await
            .map_err(|_| BusError::ChannelClosed(to.to_string()))
    }
}
