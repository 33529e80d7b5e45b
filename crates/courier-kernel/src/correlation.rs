//! Correlation table for outstanding remote requests.
//!
//! Each outbound request registers a fresh token and gets a [`PendingReply`].
//! The transport's reply loop completes the entry by token. Every removal is
//! idempotent: whichever of reply, failure, cancellation, timeout or drop
//! comes first wins and the rest are no-ops.

use crate::context::CallContext;
use courier_types::error::{CourierError, CourierResult};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

struct PendingEntry<T> {
    sender: oneshot::Sender<CourierResult<T>>,
    created_at: Instant,
}

/// Outstanding requests keyed by correlation token.
pub struct CorrelationTable<T> {
    pending: Arc<DashMap<String, PendingEntry<T>>>,
}

impl<T> Clone for CorrelationTable<T> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T: Send + 'static> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> CorrelationTable<T> {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Register a new outstanding request.
    pub fn register(&self) -> PendingReply<T> {
        let id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingEntry {
                sender,
                created_at: Instant::now(),
            },
        );
        PendingReply {
            id,
            receiver: Some(receiver),
            table: self.clone(),
        }
    }

    /// Deliver a reply. Returns `false` when the token is unknown or already settled.
    pub fn complete(&self, id: &str, value: T) -> bool {
        self.settle(id, Ok(value))
    }

    /// Fail an outstanding request.
    pub fn fail(&self, id: &str, error: CourierError) -> bool {
        self.settle(id, Err(error))
    }

    /// Drop an entry without notifying the waiter.
    pub fn cancel(&self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Fail every outstanding request, e.g. when the reply channel is lost.
    pub fn fail_all(&self, make_error: impl Fn() -> CourierError) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.fail(id, make_error())).count()
    }

    /// Fail entries older than `max_age` with a timeout.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.value().created_at.elapsed() > max_age)
            .map(|e| e.key().clone())
            .collect();
        expired
            .iter()
            .filter(|id| self.fail(id, CourierError::TimedOut(id.to_string())))
            .count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn settle(&self, id: &str, result: CourierResult<T>) -> bool {
        match self.pending.remove(id) {
            Some((_, entry)) => {
                // The waiter may have gone away between removal and send.
                let _ = entry.sender.send(result);
                true
            }
            None => {
                debug!(correlation_id = %id, "Reply for unknown or settled request");
                false
            }
        }
    }
}

/// Waiter side of one outstanding request. Dropping it removes the entry.
pub struct PendingReply<T: Send + 'static> {
    id: String,
    receiver: Option<oneshot::Receiver<CourierResult<T>>>,
    table: CorrelationTable<T>,
}

impl<T: Send + 'static> PendingReply<T> {
    /// Correlation token to put on the wire.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the reply, the call's cancellation, or `timeout`.
    pub async fn wait(mut self, ctx: &CallContext, timeout: Option<Duration>) -> CourierResult<T> {
        let receiver = self
            .receiver
            .take()
            .ok_or_else(|| CourierError::Internal("reply already awaited".to_string()))?;
        let timeout = ctx.reply_timeout().or(timeout);

        let reply = async {
            receiver
                .await
                .map_err(|_| CourierError::Connection("reply channel closed".to_string()))?
        };

        tokio::select! {
            result = reply => result,
            _ = ctx.cancellation().cancelled() => Err(CourierError::Cancelled),
            _ = sleep_or_forever(timeout) => Err(CourierError::TimedOut(self.id.clone())),
        }
    }
}

impl<T: Send + 'static> Drop for PendingReply<T> {
    fn drop(&mut self) {
        self.table.cancel(&self.id);
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_replies_reach_their_own_caller() {
        let table: CorrelationTable<&'static str> = CorrelationTable::new();
        let a = table.register();
        let b = table.register();
        let (id_a, id_b) = (a.id().to_string(), b.id().to_string());
        assert_ne!(id_a, id_b);

        assert!(table.complete(&id_b, "for b"));
        assert!(table.complete(&id_a, "for a"));

        let ctx = CallContext::new();
        assert_eq!(a.wait(&ctx, None).await.unwrap(), "for a");
        assert_eq!(b.wait(&ctx, None).await.unwrap(), "for b");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_double_completion_is_noop() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        let pending = table.register();
        let id = pending.id().to_string();
        assert!(table.complete(&id, 1));
        assert!(!table.complete(&id, 2));
        assert!(!table.cancel(&id));
        assert_eq!(pending.wait(&CallContext::new(), None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_removes_entry() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        let pending = table.register();
        let id = pending.id().to_string();
        let token = CancellationToken::new();
        token.cancel();
        let ctx = CallContext::new().with_cancellation(token);
        let err = pending.wait(&ctx, None).await.unwrap_err();
        assert!(matches!(err, CourierError::Cancelled));
        assert!(!table.contains(&id));
        assert!(!table.complete(&id, 9));
    }

    #[tokio::test]
    async fn test_timeout_and_drop() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        let pending = table.register();
        let err = pending
            .wait(&CallContext::new(), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::TimedOut(_)));
        assert!(table.is_empty());

        let dropped = table.register();
        assert_eq!(table.len(), 1);
        drop(dropped);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_and_eviction() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        let first = table.register();
        let second = table.register();
        assert_eq!(
            table.fail_all(|| CourierError::Connection("lost".into())),
            2
        );
        let err = first.wait(&CallContext::new(), None).await.unwrap_err();
        assert!(matches!(err, CourierError::Connection(_)));
        drop(second);

        let old = table.register();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(table.evict_older_than(Duration::from_millis(5)), 1);
        let err = old.wait(&CallContext::new(), None).await.unwrap_err();
        assert!(matches!(err, CourierError::TimedOut(_)));
    }
}
