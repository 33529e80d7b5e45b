//! Outbound half of the queue transport.
//!
//! Requests are published to the router exchange with `mandatory` set and the
//! process's private reply queue as `reply_to`; the reply loop completes the
//! matching correlation entry. Notifications are published without waiting.

use super::broker::{Delivery, MessageProperties, PublishOutcome, QueueChannel, QueueConnector, QueueOptions};
use super::listener::close_channel;
use async_trait::async_trait;
use courier_kernel::{CallContext, CorrelationTable, DispatchFilter, MessageDispatcher, OutboundMessage};
use courier_types::config::QueueTransportConfig;
use courier_types::envelope::ResponseEnvelope;
use courier_types::error::{CourierError, CourierResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Floor for the reconnection delay.
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone)]
struct Session {
    channel: Arc<dyn QueueChannel>,
    reply_queue: String,
}

/// Sends requests and notifications through the router exchange.
pub struct QueueDispatcher {
    config: QueueTransportConfig,
    connector: Arc<dyn QueueConnector>,
    session: RwLock<Option<Session>>,
    pending: CorrelationTable<ResponseEnvelope>,
    filter: DispatchFilter,
    reply_timeout: Option<Duration>,
    sessions_opened: AtomicU64,
    shutdown: CancellationToken,
}

impl QueueDispatcher {
    /// Connect, declare the exchange and the reply queue, and start the reply
    /// loop. Failing to reach the broker here is fatal.
    pub async fn start(config: QueueTransportConfig, connector: Arc<dyn QueueConnector>) -> CourierResult<Arc<Self>> {
        let dispatcher = Arc::new(Self {
            filter: DispatchFilter::from_rules(&config.rules),
            reply_timeout: config.reply_timeout_secs.map(Duration::from_secs),
            config,
            connector,
            session: RwLock::new(None),
            pending: CorrelationTable::new(),
            sessions_opened: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        let (channel, replies) = dispatcher.open_session().await?;
        tokio::spawn(Arc::clone(&dispatcher).reply_loop(channel, replies));
        Ok(dispatcher)
    }

    /// Name of the current reply queue, if connected.
    pub async fn reply_queue(&self) -> Option<String> {
        self.session.read().await.as_ref().map(|s| s.reply_queue.clone())
    }

    pub async fn is_connected(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Number of successful (re)connections.
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    /// Requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Stop the reply loop, close the channel and fail every waiting request.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let session = self.session.write().await.take();
        if let Some(session) = session {
            close_channel(session.channel.as_ref()).await;
        }
        self.pending.fail_all(|| CourierError::ShuttingDown);
    }

    async fn open_session(&self) -> CourierResult<(Arc<dyn QueueChannel>, mpsc::Receiver<Delivery>)> {
        let channel = self.connector.connect().await?;
        match self.declare_replies(&channel).await {
            Ok(replies) => Ok((channel, replies)),
            Err(e) => {
                close_channel(channel.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn declare_replies(&self, channel: &Arc<dyn QueueChannel>) -> CourierResult<mpsc::Receiver<Delivery>> {
        channel
            .declare_exchange(&self.config.exchange_name, self.config.durable)
            .await?;

        let name = format!("{}.{}", self.config.reply_queue_prefix, uuid::Uuid::new_v4().simple());
        let reply_queue = channel
            .declare_queue(
                &name,
                &QueueOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
            )
            .await?;

        if let Err(e) = channel.qos(self.config.per_consumer_qos.max(1), false).await {
            warn!(error = %e, "Broker does not support consumer QoS");
        }
        let replies = channel.consume(&reply_queue, &reply_queue).await?;

        info!(
            exchange = %self.config.exchange_name,
            reply_queue = %reply_queue,
            "Queue dispatcher connected"
        );
        *self.session.write().await = Some(Session {
            channel: Arc::clone(channel),
            reply_queue,
        });
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(replies)
    }

    async fn current(&self) -> CourierResult<Session> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| CourierError::Connection("queue transport is reconnecting".to_string()))
    }

    async fn reply_loop(self: Arc<Self>, mut channel: Arc<dyn QueueChannel>, mut replies: mpsc::Receiver<Delivery>) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                next = replies.recv() => next,
            };
            match next {
                Some(delivery) => self.on_reply(channel.as_ref(), delivery).await,
                None => {
                    self.session.write().await.take();
                    let failed = self
                        .pending
                        .fail_all(|| CourierError::Connection("queue broker connection lost".to_string()));
                    warn!(failed, "Queue dispatcher lost its connection");
                    close_channel(channel.as_ref()).await;
                    match self.reconnect().await {
                        Some((new_channel, new_replies)) => {
                            channel = new_channel;
                            replies = new_replies;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn reconnect(&self) -> Option<(Arc<dyn QueueChannel>, mpsc::Receiver<Delivery>)> {
        let delay = Duration::from_secs(self.config.reconnect_interval_secs).max(MIN_RECONNECT_DELAY);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.open_session().await {
                Ok(session) => return Some(session),
                Err(e) => warn!(error = %e, retry_in = ?delay, "Queue dispatcher reconnection failed"),
            }
        }
    }

    async fn on_reply(&self, channel: &dyn QueueChannel, delivery: Delivery) {
        if let Err(e) = channel.ack(delivery.delivery_tag).await {
            debug!(error = %e, "Reply ack failed");
        }
        let Some(id) = delivery.properties.correlation_id.as_deref() else {
            warn!("Reply without correlation id dropped");
            return;
        };
        match ResponseEnvelope::from_bytes(&delivery.body) {
            Ok(envelope) => {
                self.pending.complete(id, envelope);
            }
            Err(e) => {
                self.pending.fail(id, e);
            }
        }
    }
}

#[async_trait]
impl MessageDispatcher for QueueDispatcher {
    fn name(&self) -> &str {
        "queue"
    }

    fn can_dispatch(&self, message: &OutboundMessage) -> bool {
        self.filter.allows(&message.full_name)
    }

    async fn dispatch(&self, message: &OutboundMessage, ctx: &CallContext) -> CourierResult<ResponseEnvelope> {
        let session = self.current().await?;
        let body = message.body()?;
        let pending = self.pending.register();
        let properties = MessageProperties::json()
            .with_correlation_id(pending.id())
            .with_reply_to(session.reply_queue.as_str());

        debug!(route = %message.route, correlation_id = %pending.id(), "Publishing request");
        let outcome = session
            .channel
            .publish(&self.config.exchange_name, &message.route, true, properties, &body)
            .await?;
        if let PublishOutcome::Returned { reply_text } = outcome {
            return Err(CourierError::Undeliverable(format!("{} ({reply_text})", message.route)));
        }

        pending.wait(ctx, self.reply_timeout).await
    }

    async fn notify(&self, message: &OutboundMessage, _ctx: &CallContext) -> CourierResult<()> {
        let session = self.current().await?;
        let body = message.body()?;
        debug!(route = %message.route, "Publishing notification");
        session
            .channel
            .publish(
                &self.config.exchange_name,
                &message.route,
                false,
                MessageProperties::json(),
                &body,
            )
            .await?;
        Ok(())
    }
}
