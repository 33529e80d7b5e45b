//! Notification publishers: how one notification reaches its local handlers.

use crate::context::CallContext;
use crate::erased::ErasedMessage;
use crate::handler::ErasedNotificationHandler;
use async_trait::async_trait;
use courier_types::config::PublishStrategy;
use courier_types::error::{CourierError, CourierResult};
use std::sync::Arc;
use tracing::warn;

/// Strategy for invoking the handlers of one notification.
#[async_trait]
pub trait NotificationPublisher: Send + Sync + 'static {
    async fn publish(
        &self,
        handlers: &[Arc<dyn ErasedNotificationHandler>],
        notification: &dyn ErasedMessage,
        ctx: &CallContext,
    ) -> CourierResult<()>;
}

/// Awaits handlers one after another; the first failure stops the fan-out.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialPublisher;

#[async_trait]
impl NotificationPublisher for SequentialPublisher {
    async fn publish(
        &self,
        handlers: &[Arc<dyn ErasedNotificationHandler>],
        notification: &dyn ErasedMessage,
        ctx: &CallContext,
    ) -> CourierResult<()> {
        for handler in handlers {
            if ctx.is_cancelled() {
                return Err(CourierError::Cancelled);
            }
            handler.handle(notification, ctx).await?;
        }
        Ok(())
    }
}

/// Runs all handlers concurrently and aggregates their failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcurrentPublisher;

#[async_trait]
impl NotificationPublisher for ConcurrentPublisher {
    async fn publish(
        &self,
        handlers: &[Arc<dyn ErasedNotificationHandler>],
        notification: &dyn ErasedMessage,
        ctx: &CallContext,
    ) -> CourierResult<()> {
        let results =
            futures::future::join_all(handlers.iter().map(|h| h.handle(notification, ctx))).await;

        let mut errors: Vec<CourierError> = Vec::new();
        for (handler, result) in handlers.iter().zip(results) {
            if let Err(e) = result {
                warn!(handler = handler.handler_name(), error = %e, "Notification handler failed");
                errors.push(e);
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(CourierError::Aggregate(errors)),
        }
    }
}

/// Publisher for a configured strategy.
pub fn publisher_for(strategy: PublishStrategy) -> Arc<dyn NotificationPublisher> {
    match strategy {
        PublishStrategy::Sequential => Arc::new(SequentialPublisher),
        PublishStrategy::Concurrent => Arc::new(ConcurrentPublisher),
    }
}
