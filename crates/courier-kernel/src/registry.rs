//! Handler registration table.
//!
//! Handlers, behaviors and inbound-decodable types are registered explicitly
//! at startup. The table is frozen when the [`Mediator`](crate::Mediator) is
//! built; every registration error is a fatal startup error.

use crate::erased::MessageInfo;
use crate::handler::{
    ErasedNotificationHandler, ErasedRequestHandler, NotificationHandler, RequestHandler,
    TypedNotificationHandler, TypedRequestHandler,
};
use crate::pipeline::{
    ExceptionHandlerBehavior, PipelineBehavior, PostProcessorBehavior, PreProcessorBehavior,
    RequestExceptionHandler, RequestPostProcessor, RequestPreProcessor,
};
use crate::stream::{StreamEntry, StreamNext, StreamPipelineBehavior, StreamRequestHandler};
use courier_types::config::RegistryLimits;
use courier_types::error::{CourierError, CourierResult};
use courier_types::message::{Notification, Request, StreamRequest};
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub(crate) struct RequestEntry {
    pub(crate) info: Arc<MessageInfo>,
    pub(crate) handler: Option<Arc<dyn ErasedRequestHandler>>,
    pub(crate) behaviors: Vec<Arc<dyn PipelineBehavior>>,
}

pub(crate) struct NotificationEntry {
    pub(crate) info: Arc<MessageInfo>,
    pub(crate) handlers: Vec<Arc<dyn ErasedNotificationHandler>>,
}

/// Registered handlers, behaviors and message types.
pub struct HandlerRegistry {
    limits: RegistryLimits,
    requests: HashMap<TypeId, RequestEntry>,
    notifications: HashMap<TypeId, NotificationEntry>,
    by_name: HashMap<String, Arc<MessageInfo>>,
    behaviors: Vec<Arc<dyn PipelineBehavior>>,
    /// `StreamEntry<R>` per stream request type.
    streams: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    stream_names: HashSet<String>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::with_limits(RegistryLimits::default())
    }

    pub fn with_limits(limits: RegistryLimits) -> Self {
        Self {
            limits,
            requests: HashMap::new(),
            notifications: HashMap::new(),
            by_name: HashMap::new(),
            behaviors: Vec::new(),
            streams: HashMap::new(),
            stream_names: HashSet::new(),
        }
    }

    /// Register the single handler of request type `R`.
    pub fn register_request<R, H>(&mut self, handler: H) -> CourierResult<&mut Self>
    where
        R: Request,
        H: RequestHandler<R>,
    {
        let entry = self.request_entry::<R>()?;
        if entry.handler.is_some() {
            return Err(CourierError::Registration(format!(
                "request {} already has a handler",
                entry.info.full_name()
            )));
        }
        entry.handler = Some(Arc::new(TypedRequestHandler::<R, H>::new(handler)));
        debug!(type_name = %entry.info.full_name(), "Registered request handler");
        Ok(self)
    }

    /// Add a handler for notification type `N`.
    pub fn register_notification<N, H>(&mut self, handler: H) -> CourierResult<&mut Self>
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        let max = self.limits.max_handlers_per_notification;
        let entry = self.notification_entry::<N>()?;
        if entry.handlers.len() >= max {
            return Err(CourierError::Registration(format!(
                "notification {} exceeds {max} handlers",
                entry.info.full_name()
            )));
        }
        entry
            .handlers
            .push(Arc::new(TypedNotificationHandler::<N, H>::new(handler)));
        debug!(
            type_name = %entry.info.full_name(),
            handlers = entry.handlers.len(),
            "Registered notification handler"
        );
        Ok(self)
    }

    /// Make request type `R` known without a local handler, e.g. a type this
    /// process only sends to remote handlers.
    pub fn declare_request<R: Request>(&mut self) -> CourierResult<&mut Self> {
        self.request_entry::<R>()?;
        Ok(self)
    }

    /// Make notification type `N` known without a local handler.
    pub fn declare_notification<N: Notification>(&mut self) -> CourierResult<&mut Self> {
        self.notification_entry::<N>()?;
        Ok(self)
    }

    /// Append a behavior applied to every request type.
    pub fn add_behavior(&mut self, behavior: impl PipelineBehavior) -> &mut Self {
        self.behaviors.push(Arc::new(behavior));
        self
    }

    /// Append a behavior applied to request type `R` only. Per-type behaviors
    /// run inside the global ones.
    pub fn add_behavior_for<R: Request>(&mut self, behavior: impl PipelineBehavior) -> CourierResult<&mut Self> {
        self.request_entry::<R>()?.behaviors.push(Arc::new(behavior));
        Ok(self)
    }

    pub fn add_pre_processor<R, P>(&mut self, processor: P) -> CourierResult<&mut Self>
    where
        R: Request,
        P: RequestPreProcessor<R>,
    {
        self.add_behavior_for::<R>(PreProcessorBehavior::<R, P>::new(processor))
    }

    pub fn add_post_processor<R, P>(&mut self, processor: P) -> CourierResult<&mut Self>
    where
        R: Request,
        P: RequestPostProcessor<R>,
    {
        self.add_behavior_for::<R>(PostProcessorBehavior::<R, P>::new(processor))
    }

    pub fn add_exception_handler<R, H>(&mut self, handler: H) -> CourierResult<&mut Self>
    where
        R: Request,
        H: RequestExceptionHandler<R>,
    {
        self.add_behavior_for::<R>(ExceptionHandlerBehavior::<R, H>::new(handler))
    }

    /// Register the single handler of stream request type `R`.
    pub fn register_stream<R, H>(&mut self, handler: H) -> CourierResult<&mut Self>
    where
        R: StreamRequest,
        H: StreamRequestHandler<R>,
    {
        let entry = self.stream_entry::<R>()?;
        if entry.handler.is_some() {
            return Err(CourierError::Registration(format!(
                "stream request {} already has a handler",
                R::descriptor().full_name()
            )));
        }
        entry.handler = Some(Arc::new(handler));
        debug!(type_name = %R::descriptor().full_name(), "Registered stream handler");
        Ok(self)
    }

    /// Append a behavior around the stream handler of `R`.
    pub fn add_stream_behavior<R, B>(&mut self, behavior: B) -> CourierResult<&mut Self>
    where
        R: StreamRequest,
        B: StreamPipelineBehavior<R>,
    {
        self.stream_entry::<R>()?.behaviors.push(Arc::new(behavior));
        Ok(self)
    }

    /// Look up a registered or declared type by its full name.
    pub fn info_by_full_name(&self, full_name: &str) -> Option<Arc<MessageInfo>> {
        self.by_name.get(full_name).cloned()
    }

    /// Number of known message types.
    pub fn type_count(&self) -> usize {
        self.requests.len() + self.notifications.len() + self.streams.len()
    }

    pub fn has_request_handler(&self, type_id: TypeId) -> bool {
        self.requests
            .get(&type_id)
            .is_some_and(|entry| entry.handler.is_some())
    }

    pub fn notification_handler_count(&self, type_id: TypeId) -> usize {
        self.notifications
            .get(&type_id)
            .map(|entry| entry.handlers.len())
            .unwrap_or(0)
    }

    pub(crate) fn request(&self, type_id: TypeId) -> Option<&RequestEntry> {
        self.requests.get(&type_id)
    }

    pub(crate) fn notification(&self, type_id: TypeId) -> Option<&NotificationEntry> {
        self.notifications.get(&type_id)
    }

    pub(crate) fn behaviors(&self) -> &[Arc<dyn PipelineBehavior>] {
        &self.behaviors
    }

    /// Registered info for `R`, or a fresh one for an undeclared type.
    pub(crate) fn request_info<R: Request>(&self) -> Arc<MessageInfo> {
        self.requests
            .get(&TypeId::of::<R>())
            .map(|entry| entry.info.clone())
            .unwrap_or_else(|| Arc::new(MessageInfo::request::<R>()))
    }

    pub(crate) fn notification_info<N: Notification>(&self) -> Arc<MessageInfo> {
        self.notifications
            .get(&TypeId::of::<N>())
            .map(|entry| entry.info.clone())
            .unwrap_or_else(|| Arc::new(MessageInfo::notification::<N>()))
    }

    fn request_entry<R: Request>(&mut self) -> CourierResult<&mut RequestEntry> {
        let type_id = TypeId::of::<R>();
        if !self.requests.contains_key(&type_id) {
            let info = Arc::new(MessageInfo::request::<R>());
            self.admit(&info)?;
            self.requests.insert(
                type_id,
                RequestEntry {
                    info,
                    handler: None,
                    behaviors: Vec::new(),
                },
            );
        }
        self.requests
            .get_mut(&type_id)
            .ok_or_else(|| CourierError::Internal("request entry vanished".to_string()))
    }

    fn notification_entry<N: Notification>(&mut self) -> CourierResult<&mut NotificationEntry> {
        let type_id = TypeId::of::<N>();
        if !self.notifications.contains_key(&type_id) {
            let info = Arc::new(MessageInfo::notification::<N>());
            self.admit(&info)?;
            self.notifications.insert(
                type_id,
                NotificationEntry {
                    info,
                    handlers: Vec::new(),
                },
            );
        }
        self.notifications
            .get_mut(&type_id)
            .ok_or_else(|| CourierError::Internal("notification entry vanished".to_string()))
    }

    /// Stream pipeline of `R`, or `None` when no handler is registered.
    pub(crate) fn stream_pipeline<R: StreamRequest>(&self) -> Option<StreamNext<R>> {
        self.streams
            .get(&TypeId::of::<R>())?
            .downcast_ref::<StreamEntry<R>>()?
            .pipeline()
    }

    fn stream_entry<R: StreamRequest>(&mut self) -> CourierResult<&mut StreamEntry<R>> {
        let type_id = TypeId::of::<R>();
        if !self.streams.contains_key(&type_id) {
            let name = R::descriptor().full_name();
            if self.type_count() >= self.limits.max_types {
                return Err(CourierError::Registration(format!(
                    "cannot register {name}: limit of {} message types reached",
                    self.limits.max_types
                )));
            }
            if !self.stream_names.insert(name.clone()) {
                return Err(CourierError::Registration(format!(
                    "two stream request types share the name {name}"
                )));
            }
            self.streams.insert(type_id, Box::new(StreamEntry::<R>::default()));
        }
        self.streams
            .get_mut(&type_id)
            .and_then(|entry| entry.downcast_mut::<StreamEntry<R>>())
            .ok_or_else(|| CourierError::Internal("stream entry vanished".to_string()))
    }

    fn admit(&mut self, info: &Arc<MessageInfo>) -> CourierResult<()> {
        if self.type_count() >= self.limits.max_types {
            return Err(CourierError::Registration(format!(
                "cannot register {}: limit of {} message types reached",
                info.full_name(),
                self.limits.max_types
            )));
        }
        if let Some(existing) = self.by_name.get(info.full_name()) {
            return Err(CourierError::Registration(format!(
                "{} and {} share the name {}",
                existing.rust_type(),
                info.rust_type(),
                info.full_name()
            )));
        }
        self.by_name
            .insert(info.full_name().to_string(), info.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{notification_fn, request_fn};
    use courier_types::message::Message;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Serialize, Deserialize)]
    struct Ping;
    impl Message for Ping {
        const NAMESPACE: &'static str = "Diag";
        const NAME: &'static str = "Ping";
    }
    impl Request for Ping {
        type Response = String;
    }

    #[derive(Clone, Serialize, Deserialize)]
    struct Tick;
    impl Message for Tick {
        const NAMESPACE: &'static str = "Diag";
        const NAME: &'static str = "Tick";
    }
    impl Notification for Tick {}

    #[derive(Clone, Serialize, Deserialize)]
    struct Impostor;
    impl Message for Impostor {
        const NAMESPACE: &'static str = "Diag";
        const NAME: &'static str = "Ping";
    }
    impl Request for Impostor {
        type Response = ();
    }

    #[test]
    fn test_duplicate_request_handler_rejected() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_request::<Ping, _>(request_fn(|_: Ping| async { Ok("pong".to_string()) }))
            .unwrap();
        let err = registry
            .register_request::<Ping, _>(request_fn(|_: Ping| async { Ok("again".to_string()) }))
            .err()
            .unwrap();
        assert!(matches!(err, CourierError::Registration(_)));
    }

    #[test]
    fn test_name_collision_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.declare_request::<Ping>().unwrap();
        let err = registry.declare_request::<Impostor>().err().unwrap();
        assert!(err.to_string().contains("Diag.Ping"));
    }

    #[test]
    fn test_limits_enforced() {
        let mut registry = HandlerRegistry::with_limits(RegistryLimits {
            max_types: 1,
            max_handlers_per_notification: 1,
        });
        registry
            .register_notification::<Tick, _>(notification_fn(|_: Tick| async { Ok(()) }))
            .unwrap();
        assert!(registry
            .register_notification::<Tick, _>(notification_fn(|_: Tick| async { Ok(()) }))
            .is_err());
        assert!(registry.declare_request::<Ping>().is_err());
        assert_eq!(registry.type_count(), 1);
    }

    #[test]
    fn test_lookup_by_full_name() {
        let mut registry = HandlerRegistry::new();
        registry.declare_notification::<Tick>().unwrap();
        let info = registry.info_by_full_name("Diag.Tick").unwrap();
        assert!(info.is_notification());
        assert!(registry.info_by_full_name("Diag.Missing").is_none());
        assert_eq!(registry.notification_handler_count(TypeId::of::<Tick>()), 0);
    }
}
