//! Mediator: the dispatch engine.
//!
//! Entry point for application code (`send`, `publish`) and for transport
//! listeners (`send_dyn`, `publish_dyn`). Requests run through their cached
//! wrapper; with a [`Router`] attached, the router's behavior sits innermost
//! in every pipeline and remote notifications are handed to its dispatchers.
//! Stream requests are served in-process through [`Mediator::create_stream`].

use crate::context::CallContext;
use crate::erased::{downcast, DynMessage, MessageInfo};
use crate::pipeline::PipelineBehavior;
use crate::publisher::{publisher_for, NotificationPublisher, SequentialPublisher};
use crate::registry::HandlerRegistry;
use crate::router::{HandlerLocation, Router, RouterBehavior};
use crate::stream::ItemStream;
use crate::wrapper::{NotificationWrapper, RequestWrapper, WrapperCache};
use courier_types::config::PublishStrategy;
use courier_types::error::{CourierError, CourierResult};
use courier_types::message::{MessageKind, NonBlockingRequest, Notification, Request, StreamRequest};
use futures::stream::{self, StreamExt};
use std::any::TypeId;
use std::sync::Arc;
use tracing::{debug, warn};

/// Builder for [`Mediator`].
pub struct MediatorBuilder {
    registry: HandlerRegistry,
    publisher: Arc<dyn NotificationPublisher>,
    router: Option<Arc<Router>>,
}

impl MediatorBuilder {
    pub fn publisher(mut self, publisher: Arc<dyn NotificationPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn publish_strategy(self, strategy: PublishStrategy) -> Self {
        self.publisher(publisher_for(strategy))
    }

    pub fn router(mut self, router: Arc<Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn build(self) -> Mediator {
        let inner: Vec<Arc<dyn PipelineBehavior>> = match &self.router {
            Some(router) => vec![Arc::new(RouterBehavior::new(router.clone()))],
            None => Vec::new(),
        };
        Mediator {
            registry: Arc::new(self.registry),
            wrappers: WrapperCache::new(),
            publisher: self.publisher,
            router: self.router,
            inner_behaviors: inner,
        }
    }
}

/// The dispatch engine.
pub struct Mediator {
    registry: Arc<HandlerRegistry>,
    wrappers: WrapperCache,
    publisher: Arc<dyn NotificationPublisher>,
    router: Option<Arc<Router>>,
    inner_behaviors: Vec<Arc<dyn PipelineBehavior>>,
}

impl Mediator {
    pub fn builder(registry: HandlerRegistry) -> MediatorBuilder {
        MediatorBuilder {
            registry,
            publisher: Arc::new(SequentialPublisher),
            router: None,
        }
    }

    /// A local-only mediator with the sequential publisher.
    pub fn new(registry: HandlerRegistry) -> Self {
        Self::builder(registry).build()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn router(&self) -> Option<&Arc<Router>> {
        self.router.as_ref()
    }

    /// Send a request and wait for its response.
    pub async fn send<R: Request>(&self, request: R) -> CourierResult<R::Response> {
        self.send_with(request, CallContext::new()).await
    }

    pub async fn send_with<R: Request>(&self, request: R, ctx: CallContext) -> CourierResult<R::Response> {
        let wrapper = self.typed_request_wrapper::<R>();
        let response = ctx
            .run_until_cancelled(wrapper.handle(Box::new(request), ctx.clone()))
            .await?;
        downcast::<R::Response>(response)
    }

    /// Send a request whose only reply is an acknowledgment.
    pub async fn execute<R: Request<Response = ()>>(&self, request: R) -> CourierResult<()> {
        self.send(request).await
    }

    /// Publish a notification.
    pub async fn publish<N: Notification>(&self, notification: N) -> CourierResult<()> {
        self.publish_with(notification, CallContext::new()).await
    }

    pub async fn publish_with<N: Notification>(&self, notification: N, ctx: CallContext) -> CourierResult<()> {
        let info = match self.wrappers.cached_notification(TypeId::of::<N>()) {
            Some(wrapper) => wrapper.info().clone(),
            None => self.registry.notification_info::<N>(),
        };
        self.publish_dyn(&info, Box::new(notification), ctx).await
    }

    /// Start a non-blocking request and return once it is accepted. The
    /// request runs through its usual pipeline on a spawned task, so it is
    /// served locally or handed to a dispatcher like any other request; its
    /// response is discarded and failures are logged. Must be called from
    /// within a Tokio runtime.
    pub fn publish_request<R: NonBlockingRequest>(&self, request: R) -> CourierResult<()> {
        self.publish_request_with(request, CallContext::new())
    }

    pub fn publish_request_with<R: NonBlockingRequest>(&self, request: R, ctx: CallContext) -> CourierResult<()> {
        let wrapper = self.typed_request_wrapper::<R>();
        if let Some(router) = &self.router {
            if ctx.propagates_remote()
                && router.get_location(wrapper.info().descriptor()) == HandlerLocation::NotFound
            {
                return Err(CourierError::InvalidHandler(wrapper.info().full_name().to_string()));
            }
        }

        tokio::spawn(async move {
            let result = ctx
                .run_until_cancelled(wrapper.handle(Box::new(request), ctx.clone()))
                .await;
            if let Err(e) = result {
                warn!(
                    type_name = %wrapper.info().full_name(),
                    error = %e,
                    "Non-blocking request failed"
                );
            }
        });
        Ok(())
    }

    /// Open the item stream answering `request`.
    pub fn create_stream<R: StreamRequest>(&self, request: R) -> ItemStream<R::Item> {
        self.create_stream_with(request, CallContext::new())
    }

    /// Like [`create_stream`](Self::create_stream); the stream ends early when
    /// the context is cancelled.
    pub fn create_stream_with<R: StreamRequest>(&self, request: R, ctx: CallContext) -> ItemStream<R::Item> {
        let Some(pipeline) = self.registry.stream_pipeline::<R>() else {
            let name = R::descriptor().full_name();
            return stream::once(async move { Err(CourierError::HandlerNotFound(name)) }).boxed();
        };
        let token = ctx.cancellation().clone();
        pipeline
            .run(request, ctx)
            .take_until(async move { token.cancelled().await })
            .boxed()
    }

    /// Send an erased request of type `info`.
    pub async fn send_dyn(
        &self,
        info: &Arc<MessageInfo>,
        request: DynMessage,
        ctx: CallContext,
    ) -> CourierResult<DynMessage> {
        check_message(info, &request, MessageKind::Request)?;
        let wrapper = self.request_wrapper(info);
        ctx.run_until_cancelled(wrapper.handle(request, ctx.clone()))
            .await
    }

    /// Publish an erased notification of type `info`.
    pub async fn publish_dyn(
        &self,
        info: &Arc<MessageInfo>,
        notification: DynMessage,
        ctx: CallContext,
    ) -> CourierResult<()> {
        check_message(info, &notification, MessageKind::Notification)?;

        let location = match &self.router {
            Some(router) if ctx.propagates_remote() => router.get_location(info.descriptor()),
            _ => HandlerLocation::Local,
        };

        match (location, &self.router) {
            (HandlerLocation::Remote, Some(router)) => {
                debug!(type_name = %info.full_name(), "Publishing notification to remote handlers");
                ctx.run_until_cancelled(router.send_remote_notification(info, &*notification, &ctx))
                    .await
            }
            (HandlerLocation::NotFound, _) => Err(CourierError::InvalidHandler(info.full_name().to_string())),
            _ => {
                let wrapper = self.notification_wrapper(info);
                ctx.run_until_cancelled(wrapper.handle(&*notification, &ctx, &*self.publisher))
                    .await
            }
        }
    }

    /// The cached wrapper for request type `info`.
    pub fn request_wrapper(&self, info: &Arc<MessageInfo>) -> Arc<RequestWrapper> {
        self.wrappers.request(
            info,
            &self.registry,
            self.registry.behaviors(),
            &self.inner_behaviors,
        )
    }

    /// The cached wrapper for notification type `info`.
    pub fn notification_wrapper(&self, info: &Arc<MessageInfo>) -> Arc<NotificationWrapper> {
        self.wrappers.notification(info, &self.registry)
    }

    fn typed_request_wrapper<R: Request>(&self) -> Arc<RequestWrapper> {
        match self.wrappers.cached_request(TypeId::of::<R>()) {
            Some(wrapper) => wrapper,
            None => self.request_wrapper(&self.registry.request_info::<R>()),
        }
    }
}

fn check_message(info: &MessageInfo, message: &DynMessage, kind: MessageKind) -> CourierResult<()> {
    if info.kind() != kind {
        return Err(CourierError::InvalidArgument(format!(
            "{} is a {}, not a {kind}",
            info.full_name(),
            info.kind()
        )));
    }
    if message.as_any().type_id() != info.type_id() {
        return Err(CourierError::InvalidArgument(format!(
            "expected {} for {}, got {}",
            info.rust_type(),
            info.full_name(),
            message.rust_type_name()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{notification_fn, request_fn};
    use crate::pipeline::Next;
    use async_trait::async_trait;
    use courier_types::message::Message;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Greet {
        name: String,
    }
    impl Message for Greet {
        const NAMESPACE: &'static str = "Test";
        const NAME: &'static str = "Greet";
    }
    impl Request for Greet {
        type Response = String;
    }

    #[derive(Clone, Serialize, Deserialize)]
    struct Unhandled;
    impl Message for Unhandled {
        const NAMESPACE: &'static str = "Test";
        const NAME: &'static str = "Unhandled";
    }
    impl Request for Unhandled {
        type Response = ();
    }

    #[derive(Clone, Serialize, Deserialize)]
    struct Shout;
    impl Message for Shout {
        const NAMESPACE: &'static str = "Test";
        const NAME: &'static str = "Shout";
    }
    impl Notification for Shout {}

    #[derive(Clone, Serialize, Deserialize)]
    struct Audit {
        entry: u32,
    }
    impl Message for Audit {
        const NAMESPACE: &'static str = "Test";
        const NAME: &'static str = "Audit";
    }
    impl Request for Audit {
        type Response = ();
    }
    impl NonBlockingRequest for Audit {}

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PipelineBehavior for Recorder {
        async fn handle(
            &self,
            request: DynMessage,
            ctx: CallContext,
            next: Next<'_>,
        ) -> CourierResult<DynMessage> {
            self.log.lock().unwrap().push(format!("{}:before", self.label));
            let out = next.run(request, ctx).await;
            self.log.lock().unwrap().push(format!("{}:after", self.label));
            out
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl PipelineBehavior for ShortCircuit {
        async fn handle(
            &self,
            _request: DynMessage,
            _ctx: CallContext,
            _next: Next<'_>,
        ) -> CourierResult<DynMessage> {
            Ok(Box::new("cached".to_string()))
        }
    }

    struct RetryOnce;

    #[async_trait]
    impl PipelineBehavior for RetryOnce {
        async fn handle(
            &self,
            request: DynMessage,
            ctx: CallContext,
            next: Next<'_>,
        ) -> CourierResult<DynMessage> {
            let copy = request.clone_boxed();
            match next.run(request, ctx.clone()).await {
                Ok(response) => Ok(response),
                Err(_) => next.run(copy, ctx).await,
            }
        }
    }

    fn greet_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register_request::<Greet, _>(request_fn(|g: Greet| async move {
                Ok(format!("hello {}", g.name))
            }))
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_send_local() {
        let mediator = Mediator::new(greet_registry());
        let reply = mediator
            .send(Greet {
                name: "ada".into(),
            })
            .await
            .unwrap();
        assert_eq!(reply, "hello ada");
    }

    #[tokio::test]
    async fn test_behaviors_run_outer_to_inner() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = greet_registry();
        registry
            .add_behavior(Recorder {
                label: "outer",
                log: log.clone(),
            })
            .add_behavior(Recorder {
                label: "inner",
                log: log.clone(),
            });
        let mediator = Mediator::new(registry);
        mediator.send(Greet { name: "x".into() }).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:before", "inner:before", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn test_behavior_can_short_circuit() {
        let mut registry = greet_registry();
        registry.add_behavior_for::<Greet>(ShortCircuit).unwrap();
        let mediator = Mediator::new(registry);
        let reply = mediator.send(Greet { name: "x".into() }).await.unwrap();
        assert_eq!(reply, "cached");
    }

    #[tokio::test]
    async fn test_behavior_can_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register_request::<Greet, _>(request_fn(move |g: Greet| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(CourierError::handler("flaky"))
                    } else {
                        Ok(g.name)
                    }
                }
            }))
            .unwrap();
        registry.add_behavior(RetryOnce);
        let mediator = Mediator::new(registry);
        let reply = mediator.send(Greet { name: "again".into() }).await.unwrap();
        assert_eq!(reply, "again");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_handler_is_reported() {
        let mediator = Mediator::new(HandlerRegistry::new());
        let err = mediator.execute(Unhandled).await.unwrap_err();
        assert!(matches!(err, CourierError::HandlerNotFound(name) if name == "Test.Unhandled"));
    }

    #[tokio::test]
    async fn test_publish_reaches_every_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        for _ in 0..3 {
            let hits = hits.clone();
            registry
                .register_notification::<Shout, _>(notification_fn(move |_: Shout| {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }))
                .unwrap();
        }
        let mediator = Mediator::builder(registry)
            .publish_strategy(PublishStrategy::Concurrent)
            .build();
        mediator.publish(Shout).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_publish_without_handlers_is_ok() {
        let mediator = Mediator::new(HandlerRegistry::new());
        mediator.publish(Shout).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_aborts_send() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_request::<Greet, _>(request_fn(|_: Greet| async {
                std::future::pending::<()>().await;
                Ok(String::new())
            }))
            .unwrap();
        let mediator = Mediator::new(registry);
        let token = CancellationToken::new();
        let ctx = CallContext::new().with_cancellation(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = mediator
            .send_with(Greet { name: "x".into() }, ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_dyn_rejects_mismatched_message() {
        let mediator = Mediator::new(greet_registry());
        let info = mediator.registry().info_by_full_name("Test.Greet").unwrap();
        let err = mediator
            .send_dyn(&info, Box::new(Shout), CallContext::inbound())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CourierError::InvalidArgument(_)));

        let reply = mediator
            .send_dyn(&info, Box::new(Greet { name: "dyn".into() }), CallContext::inbound())
            .await
            .unwrap();
        assert_eq!(downcast::<String>(reply).unwrap(), "hello dyn");
    }

    #[tokio::test]
    async fn test_typed_and_erased_share_wrapper() {
        let mediator = Mediator::new(greet_registry());
        mediator.send(Greet { name: "a".into() }).await.unwrap();
        let info = mediator.registry().info_by_full_name("Test.Greet").unwrap();
        let first = mediator.request_wrapper(&info);
        let second = mediator.request_wrapper(&info);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_explicit_mode_rejects_unclassified_types() {
        let options = courier_types::options::RouterOptions::new(courier_types::options::BehaviourMode::Explicit, "svc");
        let mediator = Mediator::builder(greet_registry())
            .router(Arc::new(Router::new(options)))
            .build();

        let err = mediator.send(Greet { name: "x".into() }).await.unwrap_err();
        assert!(matches!(err, CourierError::InvalidHandler(name) if name == "Test.Greet"));
        let err = mediator.publish(Shout).await.unwrap_err();
        assert!(matches!(err, CourierError::InvalidHandler(_)));
    }

    #[tokio::test]
    async fn test_publish_request_returns_before_handler_finishes() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let gate = Arc::new(tokio::sync::Notify::new());
        let release = gate.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register_request::<Audit, _>(request_fn(move |a: Audit| {
                let tx = tx.clone();
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    let _ = tx.send(a.entry);
                    Ok(())
                }
            }))
            .unwrap();
        let mediator = Mediator::new(registry);

        mediator.publish_request(Audit { entry: 7 }).unwrap();
        assert!(rx.try_recv().is_err());
        release.notify_one();
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_publish_request_failure_is_not_returned() {
        let mediator = Mediator::new(HandlerRegistry::new());
        mediator.publish_request(Audit { entry: 1 }).unwrap();
    }

    #[tokio::test]
    async fn test_publish_request_rejected_when_unclassified() {
        let options = courier_types::options::RouterOptions::new(courier_types::options::BehaviourMode::Explicit, "svc");
        let mediator = Mediator::builder(HandlerRegistry::new())
            .router(Arc::new(Router::new(options)))
            .build();
        let err = mediator.publish_request(Audit { entry: 2 }).unwrap_err();
        assert!(matches!(err, CourierError::InvalidHandler(name) if name == "Test.Audit"));
    }
}
