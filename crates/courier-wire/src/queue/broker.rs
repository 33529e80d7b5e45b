//! Broker boundary of the queue transport.
//!
//! The dispatcher and listener talk to the broker only through these traits,
//! so the in-memory broker and the AMQP driver are interchangeable.

use async_trait::async_trait;
use courier_types::error::CourierResult;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Message properties used by the fabric.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
}

impl MessageProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Queue declaration flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// `x-consumer-timeout` argument in milliseconds.
    pub consumer_timeout_ms: Option<u64>,
}

/// Result of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the broker.
    Routed,
    /// A mandatory message matched no queue and was handed back.
    Returned { reply_text: String },
}

/// Opens channels to a broker.
#[async_trait]
pub trait QueueConnector: Send + Sync + 'static {
    /// Open a connection and one channel on it.
    async fn connect(&self) -> CourierResult<Arc<dyn QueueChannel>>;
}

/// One broker channel.
///
/// When the channel is lost every receiver returned by [`consume`] ends.
///
/// [`consume`]: QueueChannel::consume
#[async_trait]
pub trait QueueChannel: Send + Sync + 'static {
    /// Declare a topic exchange.
    async fn declare_exchange(&self, name: &str, durable: bool) -> CourierResult<()>;

    /// Declare a queue and return its name. An empty name asks the broker for one.
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> CourierResult<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> CourierResult<()>;

    /// Set prefetch for the channel (`global`) or for each new consumer.
    async fn qos(&self, prefetch_count: u16, global: bool) -> CourierResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: &[u8],
    ) -> CourierResult<PublishOutcome>;

    /// Start consuming `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> CourierResult<mpsc::Receiver<Delivery>>;

    async fn ack(&self, delivery_tag: u64) -> CourierResult<()>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> CourierResult<()>;
}
