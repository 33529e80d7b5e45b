//! Inbound half of the queue transport.
//!
//! Declares one queue per served type (or the type's explicit queue names),
//! binds it to the router exchange and consumes it on its own task, one
//! message at a time. Requests are answered on their `reply_to` queue with the
//! caller's correlation id. Every delivery is acknowledged, whatever the outcome.

use super::broker::{Delivery, MessageProperties, PublishOutcome, QueueChannel, QueueConnector, QueueOptions};
use crate::inbound::{resolve_routes, router_options, serve_notification, serve_request, LocalRoute};
use courier_kernel::{DedupCache, Mediator};
use courier_types::config::{DedupConfig, QueueTransportConfig};
use courier_types::error::CourierResult;
use courier_types::naming::{binding_key, QUEUE_SUFFIX_SEPARATOR};
use courier_types::options::RouterOptions;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// One queue to consume and the type it carries.
struct Subscription {
    route: Arc<LocalRoute>,
    queue: String,
    receiver: mpsc::Receiver<Delivery>,
}

/// Serves the router's local types from broker queues.
pub struct QueueListener {
    config: QueueTransportConfig,
    connector: Arc<dyn QueueConnector>,
    mediator: Arc<Mediator>,
    options: Arc<RouterOptions>,
    routes: Vec<Arc<LocalRoute>>,
    /// Per-process suffix for notification queues.
    instance_id: String,
    dedup: Option<DedupCache>,
    sessions_opened: AtomicU64,
    shutdown: CancellationToken,
}

impl QueueListener {
    /// Declare the topology and start consuming. Failing to reach the broker
    /// here is fatal; later connection losses are retried.
    pub async fn start(
        config: QueueTransportConfig,
        dedup: &DedupConfig,
        connector: Arc<dyn QueueConnector>,
        mediator: Arc<Mediator>,
    ) -> CourierResult<(Arc<Self>, tokio::task::JoinHandle<()>)> {
        let options = router_options(&mediator)?;
        let routes = resolve_routes(&mediator, &options, &options.local_types)?
            .into_iter()
            .map(Arc::new)
            .collect();

        let listener = Arc::new(Self {
            config,
            connector,
            mediator,
            options,
            routes,
            instance_id: uuid::Uuid::new_v4().simple().to_string(),
            dedup: DedupCache::from_config(dedup),
            sessions_opened: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        let (channel, subscriptions) = listener.open_session().await?;
        let handle = tokio::spawn(Arc::clone(&listener).run(channel, subscriptions));
        Ok((listener, handle))
    }

    /// Number of successful (re)connections.
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Physical queues this process consumes for `route`. Notification queues
    /// without explicit names get a per-process suffix so that every instance
    /// receives its own copy.
    pub fn physical_queues(&self, route: &LocalRoute) -> Vec<String> {
        if route.info.is_notification() && !self.has_explicit_names(route) {
            return vec![format!(
                "{}{}{}",
                route.canonical_name, QUEUE_SUFFIX_SEPARATOR, self.instance_id
            )];
        }
        route.queue_names.clone()
    }

    fn has_explicit_names(&self, route: &LocalRoute) -> bool {
        self.options.has_explicit_queue_names(route.info.descriptor())
    }

    fn queue_options(&self, route: &LocalRoute) -> QueueOptions {
        let consumer_timeout_ms = self.options.consumer_timeout(route.info.descriptor());
        if route.info.is_notification() {
            if self.has_explicit_names(route) {
                QueueOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    consumer_timeout_ms,
                }
            } else {
                QueueOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    consumer_timeout_ms,
                }
            }
        } else {
            QueueOptions {
                durable: self.config.durable,
                exclusive: false,
                auto_delete: self.config.auto_delete,
                consumer_timeout_ms,
            }
        }
    }

    async fn open_session(&self) -> CourierResult<(Arc<dyn QueueChannel>, Vec<Subscription>)> {
        let channel = self.connector.connect().await?;
        match self.subscribe(channel.as_ref()).await {
            Ok(subscriptions) => {
                self.sessions_opened.fetch_add(1, Ordering::SeqCst);
                info!(
                    exchange = %self.config.exchange_name,
                    queues = subscriptions.len(),
                    "Queue listener connected"
                );
                Ok((channel, subscriptions))
            }
            Err(e) => {
                close_channel(channel.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn subscribe(&self, channel: &dyn QueueChannel) -> CourierResult<Vec<Subscription>> {
        let exchange = &self.config.exchange_name;
        channel.declare_exchange(exchange, self.config.durable).await?;

        self.configure_qos(channel).await;

        let mut subscriptions = Vec::new();
        for route in &self.routes {
            let options = self.queue_options(route);
            for queue in self.physical_queues(route) {
                let declared = channel.declare_queue(&queue, &options).await?;
                channel
                    .bind_queue(&declared, exchange, binding_key(&declared))
                    .await?;
                let receiver = channel.consume(&declared, &declared).await?;
                debug!(
                    type_name = %route.info.full_name(),
                    queue = %declared,
                    exclusive = options.exclusive,
                    "Consuming queue"
                );
                subscriptions.push(Subscription {
                    route: Arc::clone(route),
                    queue: declared,
                    receiver,
                });
            }
        }

        Ok(subscriptions)
    }

    /// Channel-wide prefetch followed by per-consumer prefetch. A broker that
    /// rejects either is logged and otherwise ignored.
    async fn configure_qos(&self, channel: &dyn QueueChannel) {
        let global = if self.config.per_channel_qos == 0 {
            (self.routes.len() as u64 * u64::from(self.config.per_consumer_qos)).min(u64::from(u16::MAX)) as u16
        } else {
            self.config.per_channel_qos.min(u32::from(u16::MAX)) as u16
        };
        debug!(prefetch = global, "Configuring channel QoS");
        if let Err(e) = channel.qos(global, true).await {
            error!(error = %e, "Broker does not support channel QoS");
        }

        let per_consumer = self.config.per_consumer_qos.max(1);
        debug!(prefetch = per_consumer, "Configuring consumer QoS");
        if let Err(e) = channel.qos(per_consumer, false).await {
            error!(error = %e, "Broker does not support consumer QoS");
        }
    }

    async fn run(self: Arc<Self>, channel: Arc<dyn QueueChannel>, subscriptions: Vec<Subscription>) {
        let mut channel = channel;
        let mut subscriptions = subscriptions;
        loop {
            let mut consumers = JoinSet::new();
            for subscription in subscriptions.drain(..) {
                consumers.spawn(Arc::clone(&self).consume(Arc::clone(&channel), subscription));
            }
            let stopped = if consumers.is_empty() {
                // No queue to watch; hold the session until shutdown.
                self.shutdown.cancelled().await;
                true
            } else {
                // Every consumer ends when the channel is lost.
                tokio::select! {
                    _ = self.shutdown.cancelled() => true,
                    _ = async { while consumers.join_next().await.is_some() {} } => false,
                }
            };
            if stopped {
                consumers.abort_all();
                close_channel(channel.as_ref()).await;
                info!("Queue listener stopped");
                return;
            }

            warn!("Queue listener lost its connection");
            close_channel(channel.as_ref()).await;
            match self.reconnect().await {
                Some((new_channel, new_subscriptions)) => {
                    channel = new_channel;
                    subscriptions = new_subscriptions;
                }
                None => return,
            }
        }
    }

    async fn reconnect(&self) -> Option<(Arc<dyn QueueChannel>, Vec<Subscription>)> {
        let delay = Duration::from_secs(self.config.reconnect_interval_secs).max(MIN_RECONNECT_DELAY);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.open_session().await {
                Ok(session) => return Some(session),
                Err(e) => warn!(error = %e, retry_in = ?delay, "Queue listener reconnection failed"),
            }
        }
    }

    async fn consume(self: Arc<Self>, channel: Arc<dyn QueueChannel>, mut subscription: Subscription) {
        while let Some(delivery) = subscription.receiver.recv().await {
            if subscription.route.info.is_notification() {
                self.on_notification(&subscription.route, &delivery).await;
            } else {
                self.on_request(channel.as_ref(), &subscription.route, &delivery).await;
            }
            if let Err(e) = channel.ack(delivery.delivery_tag).await {
                warn!(queue = %subscription.queue, error = %e, "Ack failed");
            }
        }
        debug!(queue = %subscription.queue, "Queue consumer ended");
    }

    async fn on_notification(&self, route: &LocalRoute, delivery: &Delivery) {
        if let Err(e) = serve_notification(&self.mediator, &route.info, &delivery.body, self.dedup.as_ref()).await {
            error!(type_name = %route.info.full_name(), error = %e, "Notification from queue failed");
        }
    }

    async fn on_request(&self, channel: &dyn QueueChannel, route: &LocalRoute, delivery: &Delivery) {
        let envelope = serve_request(&self.mediator, &route.info, &delivery.body).await;

        let Some(reply_to) = delivery.properties.reply_to.as_deref().filter(|q| !q.trim().is_empty()) else {
            debug!(type_name = %route.info.full_name(), "Request without reply queue; reply dropped");
            return;
        };
        let body = match envelope.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                error!(type_name = %route.info.full_name(), error = %e, "Reply could not be serialized");
                return;
            }
        };

        let mut properties = MessageProperties::json();
        properties.correlation_id = delivery.properties.correlation_id.clone();
        match channel.publish("", reply_to, true, properties, &body).await {
            Ok(PublishOutcome::Routed) => {}
            Ok(PublishOutcome::Returned { reply_text }) => {
                warn!(reply_to, reply_text = %reply_text, "Reply queue is gone");
            }
            Err(e) => warn!(reply_to, error = %e, "Reply publish failed"),
        }
    }
}

/// Release a channel, logging a failure to do so.
pub(crate) async fn close_channel(channel: &dyn QueueChannel) {
    if let Err(e) = channel.close().await {
        debug!(error = %e, "Closing queue channel failed");
    }
}
