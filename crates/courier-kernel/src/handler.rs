//! Request and notification handlers.

use crate::context::CallContext;
use crate::erased::{downcast, downcast_ref, DynMessage, ErasedMessage};
use async_trait::async_trait;
use courier_types::error::{CourierError, CourierResult};
use courier_types::message::{Notification, Request};
use std::future::Future;
use std::marker::PhantomData;

/// Handles one request type and produces its response.
#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    async fn handle(&self, request: R, ctx: &CallContext) -> CourierResult<R::Response>;
}

/// Handles one notification type. Many handlers may exist per type.
#[async_trait]
pub trait NotificationHandler<N: Notification>: Send + Sync + 'static {
    async fn handle(&self, notification: &N, ctx: &CallContext) -> CourierResult<()>;
}

/// Request handler backed by an async closure.
pub struct FnRequestHandler<R, F> {
    f: F,
    _marker: PhantomData<fn(R)>,
}

/// Wrap an async closure as a [`RequestHandler`].
pub fn request_fn<R, F, Fut>(f: F) -> FnRequestHandler<R, F>
where
    R: Request,
    F: Fn(R) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CourierResult<R::Response>> + Send + 'static,
{
    FnRequestHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<R, F, Fut> RequestHandler<R> for FnRequestHandler<R, F>
where
    R: Request,
    F: Fn(R) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CourierResult<R::Response>> + Send + 'static,
{
    async fn handle(&self, request: R, _ctx: &CallContext) -> CourierResult<R::Response> {
        (self.f)(request).await
    }
}

/// Notification handler backed by an async closure.
pub struct FnNotificationHandler<N, F> {
    f: F,
    _marker: PhantomData<fn(N)>,
}

/// Wrap an async closure as a [`NotificationHandler`]. The closure receives an
/// owned copy of the notification.
pub fn notification_fn<N, F, Fut>(f: F) -> FnNotificationHandler<N, F>
where
    N: Notification,
    F: Fn(N) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CourierResult<()>> + Send + 'static,
{
    FnNotificationHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<N, F, Fut> NotificationHandler<N> for FnNotificationHandler<N, F>
where
    N: Notification,
    F: Fn(N) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CourierResult<()>> + Send + 'static,
{
    async fn handle(&self, notification: &N, _ctx: &CallContext) -> CourierResult<()> {
        (self.f)(notification.clone()).await
    }
}

// ---------------------------------------------------------------------------
// Erased handlers
// ---------------------------------------------------------------------------

/// Terminal step of a request pipeline.
#[async_trait]
pub trait ErasedRequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: DynMessage, ctx: CallContext) -> CourierResult<DynMessage>;
}

pub(crate) struct TypedRequestHandler<R, H> {
    inner: H,
    _marker: PhantomData<fn(R)>,
}

impl<R, H> TypedRequestHandler<R, H> {
    pub(crate) fn new(inner: H) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<R, H> ErasedRequestHandler for TypedRequestHandler<R, H>
where
    R: Request,
    H: RequestHandler<R>,
{
    async fn handle(&self, request: DynMessage, ctx: CallContext) -> CourierResult<DynMessage> {
        let request = downcast::<R>(request)?;
        let response = self.inner.handle(request, &ctx).await?;
        Ok(Box::new(response))
    }
}

/// Terminal used for types without a local handler. Remote types never reach
/// it because the router short-circuits the pipeline.
pub(crate) struct MissingHandler {
    pub(crate) type_name: String,
}

#[async_trait]
impl ErasedRequestHandler for MissingHandler {
    async fn handle(&self, _request: DynMessage, _ctx: CallContext) -> CourierResult<DynMessage> {
        Err(CourierError::HandlerNotFound(self.type_name.clone()))
    }
}

/// One registered notification handler.
#[async_trait]
pub trait ErasedNotificationHandler: Send + Sync + 'static {
    async fn handle(&self, notification: &dyn ErasedMessage, ctx: &CallContext) -> CourierResult<()>;

    fn handler_name(&self) -> &'static str;
}

pub(crate) struct TypedNotificationHandler<N, H> {
    inner: H,
    _marker: PhantomData<fn(N)>,
}

impl<N, H> TypedNotificationHandler<N, H> {
    pub(crate) fn new(inner: H) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<N, H> ErasedNotificationHandler for TypedNotificationHandler<N, H>
where
    N: Notification,
    H: NotificationHandler<N>,
{
    async fn handle(&self, notification: &dyn ErasedMessage, ctx: &CallContext) -> CourierResult<()> {
        let notification = downcast_ref::<N>(notification)?;
        self.inner.handle(notification, ctx).await
    }

    fn handler_name(&self) -> &'static str {
        std::any::type_name::<H>()
    }
}
