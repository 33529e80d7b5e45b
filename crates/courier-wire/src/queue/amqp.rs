//! AMQP 0-9-1 driver backed by `lapin`.

use super::broker::{Delivery, MessageProperties, PublishOutcome, QueueChannel, QueueConnector, QueueOptions};
use async_trait::async_trait;
use courier_types::config::QueueTransportConfig;
use courier_types::error::{CourierError, CourierResult};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CONSUMER_BUFFER: usize = 256;

fn amqp_error(e: lapin::Error) -> CourierError {
    match e {
        lapin::Error::IOError(io) => CourierError::Connection(io.to_string()),
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            CourierError::Connection(e.to_string())
        }
        other => CourierError::Transport(other.to_string()),
    }
}

/// Connects to the broker described by a [`QueueTransportConfig`].
pub struct LapinConnector {
    uri: String,
    client_name: String,
}

impl LapinConnector {
    pub fn new(config: &QueueTransportConfig) -> Self {
        Self {
            uri: config.uri(),
            client_name: config.client_name.clone(),
        }
    }
}

#[async_trait]
impl QueueConnector for LapinConnector {
    async fn connect(&self) -> CourierResult<Arc<dyn QueueChannel>> {
        let properties = ConnectionProperties::default().with_connection_name(self.client_name.clone().into());
        let connection = Connection::connect(&self.uri, properties).await.map_err(amqp_error)?;
        let channel = connection.create_channel().await.map_err(amqp_error)?;
        // Confirms carry basic.return back to the publisher.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(amqp_error)?;
        info!(client = %self.client_name, "AMQP connection established");
        Ok(Arc::new(LapinChannel {
            _connection: connection,
            channel,
        }))
    }
}

struct LapinChannel {
    _connection: Connection,
    channel: Channel,
}

fn to_amqp_properties(properties: &MessageProperties) -> BasicProperties {
    let mut out = BasicProperties::default();
    if let Some(id) = &properties.correlation_id {
        out = out.with_correlation_id(id.as_str().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        out = out.with_reply_to(reply_to.as_str().into());
    }
    if let Some(content_type) = &properties.content_type {
        out = out.with_content_type(content_type.as_str().into());
    }
    out
}

fn from_amqp_properties(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        correlation_id: properties.correlation_id().as_ref().map(|s| s.to_string()),
        reply_to: properties.reply_to().as_ref().map(|s| s.to_string()),
        content_type: properties.content_type().as_ref().map(|s| s.to_string()),
    }
}

#[async_trait]
impl QueueChannel for LapinChannel {
    async fn declare_exchange(&self, name: &str, durable: bool) -> CourierResult<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(amqp_error)
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> CourierResult<String> {
        let mut arguments = FieldTable::default();
        if let Some(timeout) = options.consumer_timeout_ms {
            arguments.insert("x-consumer-timeout".into(), AMQPValue::LongLongInt(timeout as i64));
        }
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(amqp_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> CourierResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(amqp_error)
    }

    async fn qos(&self, prefetch_count: u16, global: bool) -> CourierResult<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(amqp_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: &[u8],
    ) -> CourierResult<PublishOutcome> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    ..Default::default()
                },
                body,
                to_amqp_properties(&properties),
            )
            .await
            .map_err(amqp_error)?
            .await
            .map_err(amqp_error)?;

        match confirm {
            Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => Ok(PublishOutcome::Returned {
                reply_text: returned.reply_text.to_string(),
            }),
            Confirmation::Nack(None) => Err(CourierError::Transport(format!(
                "broker rejected message for {routing_key}"
            ))),
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(PublishOutcome::Routed),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> CourierResult<mpsc::Receiver<Delivery>> {
        let mut consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(amqp_error)?;

        let (sender, receiver) = mpsc::channel(CONSUMER_BUFFER);
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        let forwarded = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.to_string(),
                            routing_key: delivery.routing_key.to_string(),
                            properties: from_amqp_properties(&delivery.properties),
                            body: delivery.data,
                        };
                        if sender.send(forwarded).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "AMQP consumer failed");
                        break;
                    }
                }
            }
            debug!(queue = %queue, "AMQP consumer ended");
        });
        Ok(receiver)
    }

    async fn ack(&self, delivery_tag: u64) -> CourierResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(amqp_error)
    }

    fn is_connected(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> CourierResult<()> {
        self.channel.close(200, "closing").await.map_err(amqp_error)
    }
}
