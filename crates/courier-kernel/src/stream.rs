//! Streaming requests.
//!
//! A stream request has exactly one handler, which answers with a stream of
//! items instead of a single response. Stream behaviors wrap the handler like
//! request behaviors do, but they receive and return the whole stream, so
//! they can filter, map or extend it. Streams are served in-process only.

use crate::context::CallContext;
use courier_types::error::CourierResult;
use courier_types::message::StreamRequest;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::marker::PhantomData;
use std::sync::Arc;

/// Items produced for one stream request.
pub type ItemStream<T> = BoxStream<'static, CourierResult<T>>;

/// Produces the items answering a stream request.
pub trait StreamRequestHandler<R: StreamRequest>: Send + Sync + 'static {
    fn handle(&self, request: R, ctx: CallContext) -> ItemStream<R::Item>;
}

/// Stream handler backed by a closure returning a stream.
pub struct FnStreamHandler<R, F> {
    f: F,
    _marker: PhantomData<fn(R)>,
}

/// Wrap a closure as a [`StreamRequestHandler`].
pub fn stream_fn<R, F, S>(f: F) -> FnStreamHandler<R, F>
where
    R: StreamRequest,
    F: Fn(R) -> S + Send + Sync + 'static,
    S: Stream<Item = CourierResult<R::Item>> + Send + 'static,
{
    FnStreamHandler {
        f,
        _marker: PhantomData,
    }
}

impl<R, F, S> StreamRequestHandler<R> for FnStreamHandler<R, F>
where
    R: StreamRequest,
    F: Fn(R) -> S + Send + Sync + 'static,
    S: Stream<Item = CourierResult<R::Item>> + Send + 'static,
{
    fn handle(&self, request: R, _ctx: CallContext) -> ItemStream<R::Item> {
        (self.f)(request).boxed()
    }
}

/// A step wrapped around a stream handler.
pub trait StreamPipelineBehavior<R: StreamRequest>: Send + Sync + 'static {
    fn handle(&self, request: R, ctx: CallContext, next: StreamNext<R>) -> ItemStream<R::Item>;
}

/// Continuation running the remainder of a stream pipeline. Cloning it lets a
/// behavior start the inner stream more than once.
pub struct StreamNext<R: StreamRequest> {
    behaviors: Arc<[Arc<dyn StreamPipelineBehavior<R>>]>,
    position: usize,
    handler: Arc<dyn StreamRequestHandler<R>>,
}

impl<R: StreamRequest> Clone for StreamNext<R> {
    fn clone(&self) -> Self {
        Self {
            behaviors: Arc::clone(&self.behaviors),
            position: self.position,
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<R: StreamRequest> StreamNext<R> {
    pub(crate) fn new(
        behaviors: Arc<[Arc<dyn StreamPipelineBehavior<R>>]>,
        handler: Arc<dyn StreamRequestHandler<R>>,
    ) -> Self {
        Self {
            behaviors,
            position: 0,
            handler,
        }
    }

    pub fn run(self, request: R, ctx: CallContext) -> ItemStream<R::Item> {
        match self.behaviors.get(self.position).cloned() {
            Some(behavior) => {
                let next = Self {
                    position: self.position + 1,
                    ..self
                };
                behavior.handle(request, ctx, next)
            }
            None => self.handler.handle(request, ctx),
        }
    }
}

/// Registration state of one stream request type.
pub(crate) struct StreamEntry<R: StreamRequest> {
    pub(crate) handler: Option<Arc<dyn StreamRequestHandler<R>>>,
    pub(crate) behaviors: Vec<Arc<dyn StreamPipelineBehavior<R>>>,
}

impl<R: StreamRequest> Default for StreamEntry<R> {
    fn default() -> Self {
        Self {
            handler: None,
            behaviors: Vec::new(),
        }
    }
}

impl<R: StreamRequest> StreamEntry<R> {
    /// The pipeline, or `None` while no handler is registered.
    pub(crate) fn pipeline(&self) -> Option<StreamNext<R>> {
        let handler = self.handler.clone()?;
        Some(StreamNext::new(self.behaviors.iter().cloned().collect(), handler))
    }
}
