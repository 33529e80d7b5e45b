//! Handler-wrapper cache.
//!
//! A wrapper is the per-type object that knows how to run one message type:
//! its pipeline and terminal handler for requests, its handler executors for
//! notifications. Wrappers are built lazily on first use and cached for the
//! life of the process. Building is pure, so concurrent first calls may each
//! build one; the first inserted wins and every caller gets that same `Arc`.

use crate::context::CallContext;
use crate::erased::{DynMessage, ErasedMessage, MessageInfo};
use crate::handler::{ErasedNotificationHandler, ErasedRequestHandler, MissingHandler};
use crate::pipeline::{Next, PipelineBehavior};
use crate::publisher::NotificationPublisher;
use crate::registry::HandlerRegistry;
use courier_types::error::CourierResult;
use dashmap::DashMap;
use std::any::TypeId;
use std::sync::Arc;
use tracing::debug;

/// Runs one request type through its pipeline.
pub struct RequestWrapper {
    info: Arc<MessageInfo>,
    behaviors: Vec<Arc<dyn PipelineBehavior>>,
    handler: Arc<dyn ErasedRequestHandler>,
}

impl RequestWrapper {
    fn build(
        info: Arc<MessageInfo>,
        registry: &HandlerRegistry,
        outer: &[Arc<dyn PipelineBehavior>],
        inner: &[Arc<dyn PipelineBehavior>],
    ) -> Self {
        let entry = registry.request(info.type_id());
        let mut behaviors: Vec<Arc<dyn PipelineBehavior>> = outer.to_vec();
        if let Some(entry) = entry {
            behaviors.extend(entry.behaviors.iter().cloned());
        }
        behaviors.extend(inner.iter().cloned());

        let handler: Arc<dyn ErasedRequestHandler> = match entry.and_then(|e| e.handler.clone()) {
            Some(handler) => handler,
            None => Arc::new(MissingHandler {
                type_name: info.full_name().to_string(),
            }),
        };

        Self {
            info,
            behaviors,
            handler,
        }
    }

    pub fn info(&self) -> &Arc<MessageInfo> {
        &self.info
    }

    pub async fn handle(&self, request: DynMessage, ctx: CallContext) -> CourierResult<DynMessage> {
        Next::new(&self.info, &self.behaviors, &*self.handler)
            .run(request, ctx)
            .await
    }
}

/// Fans one notification type out to its local handlers.
pub struct NotificationWrapper {
    info: Arc<MessageInfo>,
    handlers: Vec<Arc<dyn ErasedNotificationHandler>>,
}

impl NotificationWrapper {
    fn build(info: Arc<MessageInfo>, registry: &HandlerRegistry) -> Self {
        let handlers = registry
            .notification(info.type_id())
            .map(|entry| entry.handlers.clone())
            .unwrap_or_default();
        Self { info, handlers }
    }

    pub fn info(&self) -> &Arc<MessageInfo> {
        &self.info
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub async fn handle(
        &self,
        notification: &dyn ErasedMessage,
        ctx: &CallContext,
        publisher: &dyn NotificationPublisher,
    ) -> CourierResult<()> {
        if self.handlers.is_empty() {
            debug!(type_name = %self.info.full_name(), "No local handlers for notification");
            return Ok(());
        }
        publisher.publish(&self.handlers, notification, ctx).await
    }
}

/// Process-wide cache of wrappers keyed by message type.
#[derive(Default)]
pub struct WrapperCache {
    requests: DashMap<TypeId, Arc<RequestWrapper>>,
    notifications: DashMap<TypeId, Arc<NotificationWrapper>>,
}

impl WrapperCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The request wrapper for `info`, built on first use. `outer` and `inner`
    /// are the behaviors around and inside the per-type ones.
    pub fn request(
        &self,
        info: &Arc<MessageInfo>,
        registry: &HandlerRegistry,
        outer: &[Arc<dyn PipelineBehavior>],
        inner: &[Arc<dyn PipelineBehavior>],
    ) -> Arc<RequestWrapper> {
        if let Some(existing) = self.requests.get(&info.type_id()) {
            return existing.clone();
        }
        let built = Arc::new(RequestWrapper::build(info.clone(), registry, outer, inner));
        self.requests
            .entry(info.type_id())
            .or_insert(built)
            .clone()
    }

    pub fn notification(
        &self,
        info: &Arc<MessageInfo>,
        registry: &HandlerRegistry,
    ) -> Arc<NotificationWrapper> {
        if let Some(existing) = self.notifications.get(&info.type_id()) {
            return existing.clone();
        }
        let built = Arc::new(NotificationWrapper::build(info.clone(), registry));
        self.notifications
            .entry(info.type_id())
            .or_insert(built)
            .clone()
    }

    /// Cached request wrapper, if one was already built.
    pub fn cached_request(&self, type_id: TypeId) -> Option<Arc<RequestWrapper>> {
        self.requests.get(&type_id).map(|w| w.clone())
    }

    pub fn cached_notification(&self, type_id: TypeId) -> Option<Arc<NotificationWrapper>> {
        self.notifications.get(&type_id).map(|w| w.clone())
    }

    pub fn len(&self) -> usize {
        self.requests.len() + self.notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::request_fn;
    use courier_types::message::{Message, Request};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Serialize, Deserialize)]
    struct Echo(String);
    impl Message for Echo {
        const NAMESPACE: &'static str = "Test";
        const NAME: &'static str = "Echo";
    }
    impl Request for Echo {
        type Response = String;
    }

    #[tokio::test]
    async fn test_wrapper_identity_under_concurrency() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_request::<Echo, _>(request_fn(|e: Echo| async move { Ok(e.0) }))
            .unwrap();
        let registry = Arc::new(registry);
        let cache = Arc::new(WrapperCache::new());
        let info = Arc::new(MessageInfo::request::<Echo>());

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let cache = cache.clone();
            let registry = registry.clone();
            let info = info.clone();
            tasks.push(tokio::spawn(async move {
                cache.request(&info, &registry, &[], &[])
            }));
        }

        let mut wrappers = Vec::new();
        for task in tasks {
            wrappers.push(task.await.unwrap());
        }
        let first = &wrappers[0];
        assert!(wrappers.iter().all(|w| Arc::ptr_eq(w, first)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_handler_reports_type() {
        let registry = HandlerRegistry::new();
        let cache = WrapperCache::new();
        let info = Arc::new(MessageInfo::request::<Echo>());
        let wrapper = cache.request(&info, &registry, &[], &[]);
        let err = wrapper
            .handle(Box::new(Echo("hi".into())), CallContext::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "No handler registered for Test.Echo");
    }
}
