use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Message delivered on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Publish failed: {0}")]
    Publish(String),
}

/// Per-connection settings for one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub keep_alive: Duration,
}

/// Opens a fresh broker session for a single exchange
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn DeviceChannel>, ChannelError>;
}

/// Connected pub/sub session. Owned by exactly one exchange.
#[async_trait]
pub trait DeviceChannel: Send {
    /// Subscribe and wait for the broker's acknowledgment
    async fn subscribe(&mut self, topic: &str) -> Result<(), ChannelError>;

    /// Publish at QoS 1 and wait for the broker's acknowledgment
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError>;

    /// Next inbound message; `None` once the connection is gone
    async fn recv(&mut self) -> Option<InboundMessage>;

    /// Close the session. Never fails.
    async fn disconnect(&mut self);
}
