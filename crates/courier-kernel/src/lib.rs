//! Core kernel for the Courier dispatch fabric.
//!
//! The kernel owns everything that happens inside one process: the handler
//! registry and wrapper cache, the pipeline, notification publishers, the
//! [`Mediator`] dispatch engine and the [`Router`] that decides whether a
//! message is served here or handed to a transport dispatcher. Transports live
//! in `courier-wire` and plug in through [`MessageDispatcher`].

pub mod config;
pub mod context;
pub mod correlation;
pub mod dedup;
pub mod erased;
pub mod handler;
pub mod mediator;
pub mod monitor;
pub mod pipeline;
pub mod publisher;
pub mod registry;
pub mod router;
pub mod stream;
pub mod wrapper;

pub use context::CallContext;
pub use correlation::{CorrelationTable, PendingReply};
pub use dedup::DedupCache;
pub use erased::{DynMessage, ErasedMessage, MessageInfo};
pub use handler::{notification_fn, request_fn, NotificationHandler, RequestHandler};
pub use mediator::{Mediator, MediatorBuilder};
pub use monitor::{InMemoryPerformanceMonitor, PerformanceMonitor, PerformanceStat};
pub use pipeline::{Next, PipelineBehavior};
pub use publisher::{ConcurrentPublisher, NotificationPublisher, SequentialPublisher};
pub use registry::HandlerRegistry;
pub use router::{
    DispatchFilter, HandlerLocation, MessageDispatcher, OutboundMessage, Router, RouterBehavior,
};
pub use stream::{stream_fn, ItemStream, StreamNext, StreamPipelineBehavior, StreamRequestHandler};
