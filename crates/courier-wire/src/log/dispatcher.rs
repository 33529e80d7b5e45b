//! Outbound half of the log transport.

use super::broker::{LogBroker, LogRecord};
use super::envelope::{LogReply, LogRequest};
use async_trait::async_trait;
use courier_kernel::{CallContext, CorrelationTable, DispatchFilter, MessageDispatcher, OutboundMessage};
use courier_types::config::LogTransportConfig;
use courier_types::envelope::ResponseEnvelope;
use courier_types::error::{CourierError, CourierResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Produces requests and notifications to their type topics and collects
/// replies from a private reply topic.
pub struct LogDispatcher {
    broker: Arc<dyn LogBroker>,
    reply_topic: String,
    reply_group: String,
    pending: CorrelationTable<ResponseEnvelope>,
    filter: DispatchFilter,
    reply_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl LogDispatcher {
    /// Create the reply topic, join its private group and start the reply loop.
    pub async fn start(config: LogTransportConfig, broker: Arc<dyn LogBroker>) -> CourierResult<Arc<Self>> {
        let instance = uuid::Uuid::new_v4().simple().to_string();
        let reply_topic = format!("{}.{instance}", config.reply_topic_prefix);
        broker
            .create_topic(&reply_topic, config.num_partitions, config.replication_factor)
            .await?;
        let reply_group = format!("{reply_topic}.replies");
        let replies = broker
            .subscribe(
                &reply_group,
                std::slice::from_ref(&reply_topic),
                config.channel_capacity,
            )
            .await?;
        info!(reply_topic = %reply_topic, "Log dispatcher ready");

        let dispatcher = Arc::new(Self {
            broker,
            reply_topic,
            reply_group,
            pending: CorrelationTable::new(),
            filter: DispatchFilter::from_rules(&config.rules),
            reply_timeout: config.reply_timeout_secs.map(Duration::from_secs),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(Arc::clone(&dispatcher).reply_loop(replies));
        Ok(dispatcher)
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    /// Private group the reply topic is consumed with.
    pub fn reply_group(&self) -> &str {
        &self.reply_group
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.pending.fail_all(|| CourierError::ShuttingDown);
    }

    async fn reply_loop(self: Arc<Self>, mut replies: mpsc::Receiver<LogRecord>) {
        loop {
            let record = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                record = replies.recv() => record,
            };
            let Some(record) = record else {
                let failed = self
                    .pending
                    .fail_all(|| CourierError::Connection("reply subscription closed".to_string()));
                warn!(reply_topic = %self.reply_topic, failed, "Log reply subscription ended");
                return;
            };
            match serde_json::from_slice::<LogReply>(&record.payload) {
                Ok(reply) => {
                    self.pending.complete(&reply.correlation_id, reply.reply);
                }
                Err(e) => warn!(offset = record.offset, error = %e, "Unreadable reply dropped"),
            }
        }

        drop(replies);
        if let Err(e) = self.broker.delete_group(&self.reply_group).await {
            warn!(group = %self.reply_group, error = %e, "Reply group not deleted");
        }
    }
}

#[async_trait]
impl MessageDispatcher for LogDispatcher {
    fn name(&self) -> &str {
        "log"
    }

    fn can_dispatch(&self, message: &OutboundMessage) -> bool {
        self.filter.allows(&message.full_name)
    }

    async fn dispatch(&self, message: &OutboundMessage, ctx: &CallContext) -> CourierResult<ResponseEnvelope> {
        let pending = self.pending.register();
        let record = LogRequest::request(message.payload.clone(), pending.id(), self.reply_topic.as_str());
        let body = serde_json::to_vec(&record)?;
        debug!(topic = %message.route, correlation_id = %pending.id(), "Producing request");
        self.broker.produce(&message.route, &body).await?;
        pending.wait(ctx, self.reply_timeout).await
    }

    async fn notify(&self, message: &OutboundMessage, _ctx: &CallContext) -> CourierResult<()> {
        let body = serde_json::to_vec(&LogRequest::notification(message.payload.clone()))?;
        debug!(topic = %message.route, "Producing notification");
        self.broker.produce(&message.route, &body).await
    }
}
