//! Outbound half of the RPC transport.

use super::channel::{ChannelPool, RpcChannel, RpcClient};
use async_trait::async_trait;
use courier_kernel::{CallContext, DispatchFilter, MessageDispatcher, OutboundMessage};
use courier_types::config::RpcTransportConfig;
use courier_types::envelope::ResponseEnvelope;
use courier_types::error::{CourierError, CourierResult};
use courier_types::message::TypeDescriptor;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sends each message as one unary call to the destination of its type.
pub struct RpcDispatcher {
    pool: ChannelPool,
    default_uri: String,
    /// Per-type destinations keyed by full type name.
    services: BTreeMap<String, String>,
    filter: DispatchFilter,
    reply_timeout: Option<Duration>,
}

impl RpcDispatcher {
    /// Build the dispatcher and one channel per configured destination.
    pub fn new(config: RpcTransportConfig) -> Self {
        let pool = ChannelPool::new(config.clone());
        pool.get_or_create(&config.default_service_uri);
        for uri in config.remote_services.values() {
            pool.get_or_create(uri);
        }
        info!(
            default_uri = %config.default_service_uri,
            destinations = pool.len(),
            "RPC dispatcher ready"
        );

        Self {
            pool,
            default_uri: config.default_service_uri,
            services: config.remote_services,
            filter: DispatchFilter::from_rules(&config.rules),
            reply_timeout: config.reply_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Destination URI of a type: its own entry, else the default.
    pub fn uri_for(&self, descriptor: &TypeDescriptor) -> &str {
        self.services
            .get(&descriptor.full_name())
            .map(String::as_str)
            .unwrap_or(&self.default_uri)
    }

    /// The channel for a type. Repeated calls return the same channel.
    pub fn channel_for(&self, descriptor: &TypeDescriptor) -> Arc<RpcChannel> {
        self.pool.get_or_create(self.uri_for(descriptor))
    }

    pub fn client_for(&self, descriptor: &TypeDescriptor) -> RpcClient {
        RpcClient::new(self.channel_for(descriptor))
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    fn timeout_for(&self, ctx: &CallContext) -> Option<Duration> {
        ctx.reply_timeout().or(self.reply_timeout)
    }
}

#[async_trait]
impl MessageDispatcher for RpcDispatcher {
    fn name(&self) -> &str {
        "rpc"
    }

    fn can_dispatch(&self, message: &OutboundMessage) -> bool {
        self.filter.allows(&message.full_name)
    }

    async fn dispatch(&self, message: &OutboundMessage, ctx: &CallContext) -> CourierResult<ResponseEnvelope> {
        let client = self.client_for(&message.descriptor);
        let body = serde_json::to_string(&message.payload)?;
        debug!(route = %message.route, uri = %client.channel().uri(), "RPC request");

        let call = client.handle_request(&message.route, body);
        match self.timeout_for(ctx) {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| CourierError::TimedOut(message.route.clone()))?,
            None => call.await,
        }
    }

    async fn notify(&self, message: &OutboundMessage, _ctx: &CallContext) -> CourierResult<()> {
        let body = serde_json::to_string(&message.payload)?;
        let channels = self.pool.channels();
        let results = futures::future::join_all(channels.iter().map(|channel| {
            let client = RpcClient::new(Arc::clone(channel));
            let body = body.clone();
            async move { (channel.uri().to_string(), client.handle_notification(&message.route, body).await) }
        }))
        .await;

        let mut failures = Vec::new();
        for (uri, result) in results {
            if let Err(e) = result {
                warn!(route = %message.route, uri = %uri, error = %e, "RPC notification not delivered");
                failures.push(e);
            }
        }
        if !failures.is_empty() && failures.len() == channels.len() {
            return Err(match failures.len() {
                1 => failures.remove(0),
                _ => CourierError::Aggregate(failures),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RpcTransportConfig {
        let mut config = RpcTransportConfig {
            default_service_uri: "tcp://127.0.0.1:7501".to_string(),
            ..Default::default()
        };
        config
            .remote_services
            .insert("Billing.Charge".to_string(), "tcp://127.0.0.1:7502".to_string());
        config
    }

    #[test]
    fn test_channels_created_eagerly() {
        let dispatcher = RpcDispatcher::new(config());
        assert_eq!(dispatcher.pool().len(), 2);
    }

    #[test]
    fn test_per_type_uri_then_default() {
        let dispatcher = RpcDispatcher::new(config());
        let charge = TypeDescriptor::new("Billing", "Charge");
        let other = TypeDescriptor::new("Billing", "Refund");
        assert_eq!(dispatcher.uri_for(&charge), "tcp://127.0.0.1:7502");
        assert_eq!(dispatcher.uri_for(&other), "tcp://127.0.0.1:7501");
    }

    #[test]
    fn test_channel_for_is_stable() {
        let dispatcher = RpcDispatcher::new(config());
        let charge = TypeDescriptor::new("Billing", "Charge");
        let first = dispatcher.channel_for(&charge);
        let second = dispatcher.channel_for(&charge);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dispatcher.pool().len(), 2);
    }
}
