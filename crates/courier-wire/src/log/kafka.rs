//! Kafka driver backed by `rdkafka`.

use super::broker::{forward_records, LogBroker, LogRecord};
use async_trait::async_trait;
use courier_types::config::LogTransportConfig;
use courier_types::error::{CourierError, CourierResult};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::Message;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);

fn kafka_error(e: KafkaError) -> CourierError {
    CourierError::Transport(e.to_string())
}

/// Kafka cluster access: one producer, one admin client and one consumer per
/// subscription.
pub struct KafkaBroker {
    base: ClientConfig,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
}

impl KafkaBroker {
    pub fn new(config: &LogTransportConfig) -> CourierResult<Self> {
        let mut base = ClientConfig::new();
        base.set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_name);

        let producer: FutureProducer = base
            .clone()
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(kafka_error)?;
        let admin: AdminClient<DefaultClientContext> = base.create().map_err(kafka_error)?;
        info!(servers = %config.bootstrap_servers, "Kafka clients created");
        Ok(Self { base, producer, admin })
    }
}

fn to_record<M: Message>(message: &M) -> LogRecord {
    LogRecord {
        topic: message.topic().to_string(),
        payload: message.payload().unwrap_or_default().to_vec(),
        offset: message.offset(),
    }
}

#[async_trait]
impl LogBroker for KafkaBroker {
    async fn create_topic(&self, topic: &str, partitions: i32, replication_factor: i32) -> CourierResult<()> {
        let new_topic = NewTopic::new(topic, partitions, TopicReplication::Fixed(replication_factor));
        let results = self
            .admin
            .create_topics(&[new_topic], &AdminOptions::new())
            .await
            .map_err(kafka_error)?;
        for result in results {
            match result {
                Ok(name) => debug!(topic = %name, "Topic created"),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(CourierError::Transport(format!("creating topic {name}: {code}")));
                }
            }
        }
        Ok(())
    }

    async fn produce(&self, topic: &str, payload: &[u8]) -> CourierResult<()> {
        self.producer
            .send(
                FutureRecord::<(), [u8]>::to(topic).payload(payload),
                Timeout::After(PRODUCE_TIMEOUT),
            )
            .await
            .map(|_| ())
            .map_err(|(e, _)| kafka_error(e))
    }

    async fn subscribe(&self, group: &str, topics: &[String], capacity: usize) -> CourierResult<mpsc::Receiver<LogRecord>> {
        let consumer: StreamConsumer = self
            .base
            .clone()
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(kafka_error)?;
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&names).map_err(kafka_error)?;

        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let group = group.to_string();
        tokio::spawn(async move {
            let records = consumer.stream().map(|next| next.map(|m| to_record(&m)));
            forward_records(records, sender, &group).await;
        });
        Ok(receiver)
    }
}
