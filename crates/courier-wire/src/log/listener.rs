//! Inbound half of the log transport.
//!
//! Request topics are consumed by one group shared by every instance, so each
//! request is served once. Notification topics are consumed by a group unique
//! to this process, so every instance sees every notification.

use super::broker::{LogBroker, LogRecord};
use super::envelope::{LogReply, LogRequest};
use crate::inbound::{resolve_routes, router_options, serve_notification, serve_request, LocalRoute};
use courier_kernel::{DedupCache, Mediator};
use courier_types::config::{DedupConfig, LogTransportConfig};
use courier_types::error::CourierResult;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Serves the router's local types from log topics.
pub struct LogListener {
    broker: Arc<dyn LogBroker>,
    mediator: Arc<Mediator>,
    /// Routes keyed by topic.
    routes: HashMap<String, LocalRoute>,
    notification_group: String,
    dedup: Option<DedupCache>,
    shutdown: CancellationToken,
}

impl LogListener {
    /// Create the topics, join both groups and start the consumer loops.
    pub async fn start(
        config: LogTransportConfig,
        dedup: &DedupConfig,
        broker: Arc<dyn LogBroker>,
        mediator: Arc<Mediator>,
    ) -> CourierResult<(Arc<Self>, tokio::task::JoinHandle<()>)> {
        let options = router_options(&mediator)?;
        let routes: HashMap<String, LocalRoute> = resolve_routes(&mediator, &options, &options.local_types)?
            .into_iter()
            .map(|route| (route.canonical_name.clone(), route))
            .collect();

        let mut request_topics = Vec::new();
        let mut notification_topics = Vec::new();
        for (topic, route) in &routes {
            broker
                .create_topic(topic, config.num_partitions, config.replication_factor)
                .await?;
            if route.info.is_notification() {
                notification_topics.push(topic.clone());
            } else {
                request_topics.push(topic.clone());
            }
        }
        request_topics.sort();
        notification_topics.sort();

        let notification_group = format!(
            "{}.{}",
            config.notification_group_prefix,
            uuid::Uuid::new_v4().simple()
        );
        let requests = subscribe(&*broker, &config.request_group_id, &request_topics, config.channel_capacity).await?;
        let notifications =
            subscribe(&*broker, &notification_group, &notification_topics, config.channel_capacity).await?;
        info!(
            requests = request_topics.len(),
            notifications = notification_topics.len(),
            group = %config.request_group_id,
            "Log listener started"
        );

        let listener = Arc::new(Self {
            broker,
            mediator,
            routes,
            notification_group,
            dedup: DedupCache::from_config(dedup),
            shutdown: CancellationToken::new(),
        });

        let node = Arc::clone(&listener);
        let handle = tokio::spawn(async move {
            tokio::join!(node.request_loop(requests), node.notification_loop(notifications));
            debug!("Log listener loops ended");
            // The notification group is private to this process.
            if let Err(e) = node.broker.delete_group(&node.notification_group).await {
                warn!(group = %node.notification_group, error = %e, "Notification group not deleted");
            }
        });
        Ok((listener, handle))
    }

    /// Group this process uses for notifications.
    pub fn notification_group(&self) -> &str {
        &self.notification_group
    }

    /// Stop both loops after the message in progress and leave the
    /// notification group.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn next(&self, receiver: &mut Option<mpsc::Receiver<LogRecord>>) -> Option<LogRecord> {
        let receiver = receiver.as_mut()?;
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            record = receiver.recv() => record,
        }
    }

    async fn request_loop(&self, mut receiver: Option<mpsc::Receiver<LogRecord>>) {
        while let Some(record) = self.next(&mut receiver).await {
            self.on_request(record).await;
        }
    }

    async fn notification_loop(&self, mut receiver: Option<mpsc::Receiver<LogRecord>>) {
        while let Some(record) = self.next(&mut receiver).await {
            self.on_notification(record).await;
        }
    }

    fn decode(&self, record: &LogRecord) -> Option<(&LocalRoute, LogRequest, Vec<u8>)> {
        let Some(route) = self.routes.get(&record.topic) else {
            warn!(topic = %record.topic, "Record on a topic not served here");
            return None;
        };
        let parsed = serde_json::from_slice::<LogRequest>(&record.payload)
            .and_then(|request| serde_json::to_vec(&request.message).map(|body| (request, body)));
        match parsed {
            Ok((request, body)) => Some((route, request, body)),
            Err(e) => {
                error!(topic = %record.topic, offset = record.offset, error = %e, "Unable to deserialize record");
                None
            }
        }
    }

    async fn on_request(&self, record: LogRecord) {
        let Some((route, request, body)) = self.decode(&record) else {
            return;
        };
        let envelope = serve_request(&self.mediator, &route.info, &body).await;

        let (Some(reply_to), Some(correlation_id)) = (request.reply_to, request.correlation_id) else {
            debug!(topic = %record.topic, "Request without reply topic; reply dropped");
            return;
        };
        let reply = LogReply {
            reply: envelope,
            correlation_id,
        };
        let produced = match serde_json::to_vec(&reply) {
            Ok(bytes) => self.broker.produce(&reply_to, &bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = produced {
            warn!(reply_to = %reply_to, error = %e, "Reply not produced");
        }
    }

    async fn on_notification(&self, record: LogRecord) {
        let Some((route, _, body)) = self.decode(&record) else {
            return;
        };
        if let Err(e) = serve_notification(&self.mediator, &route.info, &body, self.dedup.as_ref()).await {
            error!(topic = %record.topic, error = %e, "Notification from log failed");
        }
    }
}

async fn subscribe(
    broker: &dyn LogBroker,
    group: &str,
    topics: &[String],
    capacity: usize,
) -> CourierResult<Option<mpsc::Receiver<LogRecord>>> {
    if topics.is_empty() {
        return Ok(None);
    }
    Ok(Some(broker.subscribe(group, topics, capacity).await?))
}
