//! Per-call context.
//!
//! A [`CallContext`] travels with one `send`/`publish` call through the
//! pipeline, the router and the transport. It carries the caller's
//! cancellation token, whether the call may be propagated to remote
//! processes, and an optional explicit route.

use courier_types::error::{CourierError, CourierResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Context of one dispatch call.
#[derive(Debug, Clone)]
pub struct CallContext {
    cancel: CancellationToken,
    propagate_remote: bool,
    route: Option<String>,
    reply_timeout: Option<Duration>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            propagate_remote: true,
            route: None,
            reply_timeout: None,
        }
    }
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the caller's cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Send to this route instead of the type's canonical name.
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    /// Stop waiting for a remote reply after `timeout`.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    /// Context for messages that arrived from a transport: they are served
    /// here and never handed back to a dispatcher.
    pub fn inbound() -> Self {
        Self::default().without_remote_propagation()
    }

    pub fn without_remote_propagation(mut self) -> Self {
        self.propagate_remote = false;
        self
    }

    pub fn propagates_remote(&self) -> bool {
        self.propagate_remote
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut` unless the call is cancelled first.
    pub async fn run_until_cancelled<T, F>(&self, fut: F) -> CourierResult<T>
    where
        F: Future<Output = CourierResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CourierError::Cancelled),
            result = fut => result,
        }
    }
}
