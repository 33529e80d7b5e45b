//! Router: decides whether a message is served here or on a remote process.
//!
//! The router classifies every type against the local and remote sets of its
//! [`RouterOptions`], hands remote requests to the first transport dispatcher
//! that accepts them and fans remote notifications out to every dispatcher.
//! [`RouterBehavior`] plugs it into the request pipeline.

use crate::context::CallContext;
use crate::erased::{DynMessage, ErasedMessage, MessageInfo};
use crate::monitor::{InMemoryPerformanceMonitor, PerformanceMonitor};
use crate::pipeline::{Next, PipelineBehavior};
use async_trait::async_trait;
use courier_types::config::DispatchRules;
use courier_types::envelope::{ResponseEnvelope, ResponseStatus};
use courier_types::error::{CourierError, CourierResult};
use courier_types::message::{MessageKind, TypeDescriptor};
use courier_types::options::{BehaviourMode, RouterOptions};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Where a message type is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerLocation {
    NotFound,
    Local,
    Remote,
}

/// A message ready to be handed to a transport.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub descriptor: TypeDescriptor,
    /// Full type name; key of per-type transport configuration.
    pub full_name: String,
    /// Wire name: the explicit route of the call or the canonical name.
    pub route: String,
    pub kind: MessageKind,
    pub payload: serde_json::Value,
}

impl OutboundMessage {
    /// JSON bytes of the payload.
    pub fn body(&self) -> CourierResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.payload)?)
    }
}

/// Outbound half of a transport.
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Whether this dispatcher accepts requests of the message's type.
    fn can_dispatch(&self, message: &OutboundMessage) -> bool;

    /// Send a request and wait for its envelope.
    async fn dispatch(&self, message: &OutboundMessage, ctx: &CallContext) -> CourierResult<ResponseEnvelope>;

    /// Send a notification without waiting for handlers.
    async fn notify(&self, message: &OutboundMessage, ctx: &CallContext) -> CourierResult<()>;
}

/// Allow/deny decision shared by the transport dispatchers.
#[derive(Debug, Clone, Default)]
pub struct DispatchFilter {
    dispatch_only: BTreeSet<String>,
    dont_dispatch: BTreeSet<String>,
}

impl DispatchFilter {
    pub fn from_rules(rules: &DispatchRules) -> Self {
        Self {
            dispatch_only: rules.dispatch_only.clone(),
            dont_dispatch: rules.dont_dispatch.clone(),
        }
    }

    /// An allow list, when present, is authoritative; otherwise the deny list applies.
    pub fn allows(&self, full_name: &str) -> bool {
        if !self.dispatch_only.is_empty() {
            return self.dispatch_only.contains(full_name);
        }
        !self.dont_dispatch.contains(full_name)
    }
}

/// Local/remote placement and remote invocation.
pub struct Router {
    options: Arc<RouterOptions>,
    dispatchers: Vec<Arc<dyn MessageDispatcher>>,
    monitor: Arc<dyn PerformanceMonitor>,
}

impl Router {
    pub fn new(options: RouterOptions) -> Self {
        Self {
            options: Arc::new(options),
            dispatchers: Vec::new(),
            monitor: Arc::new(InMemoryPerformanceMonitor::new()),
        }
    }

    /// Append a dispatcher. Dispatchers are tried in the order they are added.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn MessageDispatcher>) -> Self {
        self.dispatchers.push(dispatcher);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn PerformanceMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn options(&self) -> &Arc<RouterOptions> {
        &self.options
    }

    pub fn monitor(&self) -> &Arc<dyn PerformanceMonitor> {
        &self.monitor
    }

    pub fn has_dispatchers(&self) -> bool {
        !self.dispatchers.is_empty()
    }

    pub fn local_types(&self) -> &BTreeSet<String> {
        &self.options.local_types
    }

    pub fn remote_types(&self) -> &BTreeSet<String> {
        &self.options.remote_types
    }

    /// Classify `descriptor` according to the behaviour mode.
    pub fn get_location(&self, descriptor: &TypeDescriptor) -> HandlerLocation {
        let local = self.options.is_local(descriptor);
        let remote = self.options.is_remote(descriptor);
        match self.options.behaviour {
            BehaviourMode::ImplicitLocal => {
                if remote {
                    HandlerLocation::Remote
                } else {
                    HandlerLocation::Local
                }
            }
            BehaviourMode::ImplicitRemote => {
                if local {
                    HandlerLocation::Local
                } else {
                    HandlerLocation::Remote
                }
            }
            BehaviourMode::Explicit => {
                if local {
                    HandlerLocation::Local
                } else if remote {
                    HandlerLocation::Remote
                } else {
                    HandlerLocation::NotFound
                }
            }
        }
    }

    pub fn has_local_handler(&self, descriptor: &TypeDescriptor) -> bool {
        self.get_location(descriptor) == HandlerLocation::Local
    }

    pub fn has_remote_handler(&self, descriptor: &TypeDescriptor) -> bool {
        self.get_location(descriptor) == HandlerLocation::Remote
    }

    /// Canonical wire name of `descriptor`.
    pub fn canonical_name(&self, descriptor: &TypeDescriptor) -> String {
        self.options.canonical_name(descriptor)
    }

    /// Serialize `message` for the transports.
    pub fn outbound(
        &self,
        info: &MessageInfo,
        message: &dyn ErasedMessage,
        ctx: &CallContext,
    ) -> CourierResult<OutboundMessage> {
        let route = match ctx.route() {
            Some(route) => route.to_string(),
            None => self.canonical_name(info.descriptor()),
        };
        Ok(OutboundMessage {
            descriptor: info.descriptor().clone(),
            full_name: info.full_name().to_string(),
            route,
            kind: info.kind(),
            payload: message.to_json()?,
        })
    }

    /// Send a request to the first dispatcher that accepts it and decode the reply.
    pub async fn invoke_remote(
        &self,
        info: &MessageInfo,
        request: &dyn ErasedMessage,
        ctx: &CallContext,
    ) -> CourierResult<DynMessage> {
        let message = self.outbound(info, request, ctx)?;
        let dispatcher = self
            .dispatchers
            .iter()
            .find(|d| d.can_dispatch(&message))
            .ok_or_else(|| CourierError::NoRoute(message.full_name.clone()))?;

        debug!(
            type_name = %message.full_name,
            route = %message.route,
            dispatcher = dispatcher.name(),
            "Dispatching remote request"
        );
        let envelope = ctx
            .run_until_cancelled(dispatcher.dispatch(&message, ctx))
            .await?;

        match envelope.status {
            ResponseStatus::Ok => info.decode_response(envelope.content),
            ResponseStatus::Exception => {
                error!(
                    type_name = %message.full_name,
                    remote_trace = envelope.original_stack_trace.as_deref().unwrap_or(""),
                    "Remote handler failed"
                );
                Err(envelope.into_error())
            }
        }
    }

    /// Hand a notification to every dispatcher. A failing dispatcher does not
    /// stop the others; the call fails only when every dispatcher failed.
    pub async fn send_remote_notification(
        &self,
        info: &MessageInfo,
        notification: &dyn ErasedMessage,
        ctx: &CallContext,
    ) -> CourierResult<()> {
        let message = self.outbound(info, notification, ctx)?;
        if self.dispatchers.is_empty() {
            warn!(type_name = %message.full_name, "No dispatcher for remote notification");
            return Err(CourierError::NoRoute(message.full_name));
        }

        let message = &message;
        let results = futures::future::join_all(
            self.dispatchers
                .iter()
                .map(|d| async move { (d.name(), d.notify(message, ctx).await) }),
        )
        .await;

        let mut errors = Vec::new();
        for (name, result) in results {
            if let Err(e) = result {
                warn!(
                    type_name = %message.full_name,
                    dispatcher = name,
                    error = %e,
                    "Dispatcher failed to deliver notification"
                );
                errors.push(e);
            }
        }

        if errors.len() == self.dispatchers.len() {
            return Err(match errors.len() {
                1 => errors.remove(0),
                _ => CourierError::Aggregate(errors),
            });
        }
        Ok(())
    }
}

/// Pipeline step that places each request locally or remotely and records
/// the outcome in the router's monitor.
pub struct RouterBehavior {
    router: Arc<Router>,
}

impl RouterBehavior {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl PipelineBehavior for RouterBehavior {
    async fn handle(
        &self,
        request: DynMessage,
        ctx: CallContext,
        next: Next<'_>,
    ) -> CourierResult<DynMessage> {
        let info = next.info();
        let type_name = info.full_name();
        let monitor = self.router.monitor();
        let started = Instant::now();

        // Messages that arrived from a transport are always served here.
        let location = if ctx.propagates_remote() {
            self.router.get_location(info.descriptor())
        } else {
            HandlerLocation::Local
        };

        let result = match location {
            HandlerLocation::Local => {
                monitor.new_local_request(type_name);
                next.run(request, ctx).await
            }
            HandlerLocation::Remote => {
                monitor.new_remote_request(type_name);
                self.router.invoke_remote(info, &*request, &ctx).await
            }
            HandlerLocation::NotFound => Err(CourierError::InvalidHandler(type_name.to_string())),
        };

        match &result {
            Ok(_) => monitor.successfully_completed(type_name, started.elapsed()),
            Err(_) => monitor.completed_with_exceptions(type_name, started.elapsed()),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn desc(name: &str) -> TypeDescriptor {
        TypeDescriptor::new("Shop", name)
    }

    fn options(mode: BehaviourMode, local: &[&str], remote: &[&str]) -> RouterOptions {
        let mut opts = RouterOptions::new(mode, "svc");
        opts.local_types = local.iter().map(|n| format!("Shop.{n}")).collect();
        opts.remote_types = remote.iter().map(|n| format!("Shop.{n}")).collect();
        opts
    }

    #[test]
    fn test_implicit_local() {
        let router = Router::new(options(BehaviourMode::ImplicitLocal, &[], &["OrderCreated"]));
        assert_eq!(router.get_location(&desc("OrderCreated")), HandlerLocation::Remote);
        assert_eq!(router.get_location(&desc("PingRequest")), HandlerLocation::Local);
        assert_eq!(router.get_location(&desc("Anything")), HandlerLocation::Local);
        assert!(router.has_remote_handler(&desc("OrderCreated")));
        assert!(router.has_local_handler(&desc("PingRequest")));
    }

    #[test]
    fn test_implicit_remote() {
        let router = Router::new(options(BehaviourMode::ImplicitRemote, &["PingRequest"], &[]));
        assert_eq!(router.get_location(&desc("PingRequest")), HandlerLocation::Local);
        assert_eq!(router.get_location(&desc("Other")), HandlerLocation::Remote);
    }

    #[test]
    fn test_explicit_not_found() {
        let router = Router::new(options(BehaviourMode::Explicit, &["A"], &["B"]));
        assert_eq!(router.get_location(&desc("A")), HandlerLocation::Local);
        assert_eq!(router.get_location(&desc("B")), HandlerLocation::Remote);
        assert_eq!(router.get_location(&desc("C")), HandlerLocation::NotFound);
        assert!(!router.has_local_handler(&desc("C")));
        assert!(!router.has_remote_handler(&desc("C")));
    }

    #[test]
    fn test_dispatch_filter() {
        let mut rules = DispatchRules::default();
        rules.dont_dispatch.insert("Shop.Secret".into());
        let filter = DispatchFilter::from_rules(&rules);
        assert!(filter.allows("Shop.Order"));
        assert!(!filter.allows("Shop.Secret"));

        rules.dispatch_only.insert("Shop.Order".into());
        let filter = DispatchFilter::from_rules(&rules);
        assert!(filter.allows("Shop.Order"));
        assert!(!filter.allows("Shop.Other"));
    }

    struct FailingNotifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageDispatcher for FailingNotifier {
        fn name(&self) -> &str {
            "failing"
        }
        fn can_dispatch(&self, _message: &OutboundMessage) -> bool {
            false
        }
        async fn dispatch(&self, message: &OutboundMessage, _ctx: &CallContext) -> CourierResult<ResponseEnvelope> {
            Err(CourierError::NoRoute(message.full_name.clone()))
        }
        async fn notify(&self, _message: &OutboundMessage, _ctx: &CallContext) -> CourierResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CourierError::Transport("broker down".into()))
        }
    }

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct OrderCreated {
        id: u32,
    }
    impl courier_types::Message for OrderCreated {
        const NAMESPACE: &'static str = "Shop";
        const NAME: &'static str = "OrderCreated";
    }
    impl courier_types::Notification for OrderCreated {}

    #[tokio::test]
    async fn test_notification_fails_only_when_every_dispatcher_fails() {
        let failing = Arc::new(FailingNotifier {
            calls: AtomicUsize::new(0),
        });
        let router = Router::new(options(BehaviourMode::ImplicitLocal, &[], &["OrderCreated"]))
            .with_dispatcher(failing.clone());
        let info = MessageInfo::notification::<OrderCreated>();
        let err = router
            .send_remote_notification(&info, &OrderCreated { id: 1 }, &CallContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Transport error: broker down");
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_capable_dispatcher_is_no_route() {
        let router = Router::new(options(BehaviourMode::ImplicitRemote, &[], &[])).with_dispatcher(
            Arc::new(FailingNotifier {
                calls: AtomicUsize::new(0),
            }),
        );
        let info = MessageInfo::notification::<OrderCreated>();
        let err = router
            .invoke_remote(&info, &OrderCreated { id: 1 }, &CallContext::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CourierError::NoRoute(name) if name == "Shop.OrderCreated"));
    }

    #[test]
    fn test_outbound_prefers_explicit_route() {
        let router = Router::new(options(BehaviourMode::ImplicitLocal, &[], &[]));
        let info = MessageInfo::notification::<OrderCreated>();
        let msg = router
            .outbound(&info, &OrderCreated { id: 7 }, &CallContext::new())
            .unwrap();
        assert_eq!(msg.route, "svc.Shop_OrderCreated");
        assert_eq!(msg.payload["id"], 7);

        let ctx = CallContext::new().with_route("audit.orders");
        let msg = router.outbound(&info, &OrderCreated { id: 7 }, &ctx).unwrap();
        assert_eq!(msg.route, "audit.orders");
    }
}
