//! Request pipeline: ordered behaviors wrapped around the terminal handler.
//!
//! Behaviors run outermost first in registration order. Each receives a
//! [`Next`] continuation; calling it runs the rest of the chain. [`Next`] is
//! `Copy`, so a behavior may skip it (short-circuit), call it once, or call
//! it again with a cloned request (retry).

use crate::context::CallContext;
use crate::erased::{downcast, downcast_ref, DynMessage, MessageInfo};
use crate::handler::ErasedRequestHandler;
use async_trait::async_trait;
use courier_types::error::{CourierError, CourierResult};
use courier_types::message::Request;
use futures::future::BoxFuture;
use std::marker::PhantomData;
use std::sync::Arc;

/// A step wrapped around request handling.
#[async_trait]
pub trait PipelineBehavior: Send + Sync + 'static {
    async fn handle(
        &self,
        request: DynMessage,
        ctx: CallContext,
        next: Next<'_>,
    ) -> CourierResult<DynMessage>;
}

/// Continuation running the remainder of a pipeline.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    info: &'a MessageInfo,
    behaviors: &'a [Arc<dyn PipelineBehavior>],
    handler: &'a dyn ErasedRequestHandler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        info: &'a MessageInfo,
        behaviors: &'a [Arc<dyn PipelineBehavior>],
        handler: &'a dyn ErasedRequestHandler,
    ) -> Self {
        Self {
            info,
            behaviors,
            handler,
        }
    }

    /// The message type flowing through the pipeline.
    pub fn info(&self) -> &'a MessageInfo {
        self.info
    }

    pub fn run(self, request: DynMessage, ctx: CallContext) -> BoxFuture<'a, CourierResult<DynMessage>> {
        match self.behaviors.split_first() {
            Some((behavior, rest)) => behavior.handle(
                request,
                ctx,
                Next {
                    behaviors: rest,
                    ..self
                },
            ),
            None => self.handler.handle(request, ctx),
        }
    }
}

// ---------------------------------------------------------------------------
// Pre/post processors and exception handlers
// ---------------------------------------------------------------------------

/// Runs before the handler of `R`. An error aborts the request.
#[async_trait]
pub trait RequestPreProcessor<R: Request>: Send + Sync + 'static {
    async fn process(&self, request: &R, ctx: &CallContext) -> CourierResult<()>;
}

/// Runs after the handler of `R` returned successfully.
#[async_trait]
pub trait RequestPostProcessor<R: Request>: Send + Sync + 'static {
    async fn process(&self, request: &R, response: &R::Response, ctx: &CallContext) -> CourierResult<()>;
}

/// Gets a chance to turn a failure of `R` into a response.
#[async_trait]
pub trait RequestExceptionHandler<R: Request>: Send + Sync + 'static {
    /// `Some(response)` marks the failure handled.
    async fn handle(&self, request: &R, error: &CourierError, ctx: &CallContext) -> Option<R::Response>;
}

pub(crate) struct PreProcessorBehavior<R, P> {
    processor: P,
    _marker: PhantomData<fn(R)>,
}

impl<R, P> PreProcessorBehavior<R, P> {
    pub(crate) fn new(processor: P) -> Self {
        Self {
            processor,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<R, P> PipelineBehavior for PreProcessorBehavior<R, P>
where
    R: Request,
    P: RequestPreProcessor<R>,
{
    async fn handle(
        &self,
        request: DynMessage,
        ctx: CallContext,
        next: Next<'_>,
    ) -> CourierResult<DynMessage> {
        self.processor
            .process(downcast_ref::<R>(&*request)?, &ctx)
            .await?;
        next.run(request, ctx).await
    }
}

pub(crate) struct PostProcessorBehavior<R, P> {
    processor: P,
    _marker: PhantomData<fn(R)>,
}

impl<R, P> PostProcessorBehavior<R, P> {
    pub(crate) fn new(processor: P) -> Self {
        Self {
            processor,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<R, P> PipelineBehavior for PostProcessorBehavior<R, P>
where
    R: Request,
    P: RequestPostProcessor<R>,
{
    async fn handle(
        &self,
        request: DynMessage,
        ctx: CallContext,
        next: Next<'_>,
    ) -> CourierResult<DynMessage> {
        let original = request.clone_boxed();
        let response = next.run(request, ctx.clone()).await?;
        self.processor
            .process(
                downcast_ref::<R>(&*original)?,
                downcast_ref::<R::Response>(&*response)?,
                &ctx,
            )
            .await?;
        Ok(response)
    }
}

pub(crate) struct ExceptionHandlerBehavior<R, H> {
    handler: H,
    _marker: PhantomData<fn(R)>,
}

impl<R, H> ExceptionHandlerBehavior<R, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<R, H> PipelineBehavior for ExceptionHandlerBehavior<R, H>
where
    R: Request,
    H: RequestExceptionHandler<R>,
{
    async fn handle(
        &self,
        request: DynMessage,
        ctx: CallContext,
        next: Next<'_>,
    ) -> CourierResult<DynMessage> {
        let original = downcast::<R>(request.clone_boxed())?;
        match next.run(request, ctx.clone()).await {
            Ok(response) => Ok(response),
            Err(err) => match self.handler.handle(&original, &err, &ctx).await {
                Some(recovered) => {
                    tracing::debug!(
                        type_name = %next.info().full_name(),
                        error = %err,
                        "Request failure handled by exception handler"
                    );
                    Ok(Box::new(recovered))
                }
                None => Err(err),
            },
        }
    }
}
