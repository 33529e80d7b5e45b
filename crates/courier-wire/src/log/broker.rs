//! Broker boundary of the log transport.

use async_trait::async_trait;
use courier_types::error::CourierResult;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pause after a consumer error before polling the source again.
pub const CONSUMER_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A record read from a topic.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub offset: i64,
}

/// Topic-based log broker with consumer groups.
///
/// Within a group each record goes to one member, and all records of a topic
/// go to the same member while it stays subscribed. Every group gets its own
/// copy of each record.
#[async_trait]
pub trait LogBroker: Send + Sync + 'static {
    /// Create a topic; an existing topic is not an error.
    async fn create_topic(&self, topic: &str, partitions: i32, replication_factor: i32) -> CourierResult<()>;

    async fn produce(&self, topic: &str, payload: &[u8]) -> CourierResult<()>;

    /// Join `group` for `topics`. Records arrive on the returned bounded
    /// channel; dropping it leaves the group.
    async fn subscribe(&self, group: &str, topics: &[String], capacity: usize) -> CourierResult<mpsc::Receiver<LogRecord>>;

    /// Forget a group nobody will join again. Brokers that expire idle groups
    /// on their own may keep the default.
    async fn delete_group(&self, _group: &str) -> CourierResult<()> {
        Ok(())
    }
}

/// Move records from a broker consumer into a subscription channel until the
/// channel is dropped or the source ends. A source error is logged and
/// polling pauses for [`CONSUMER_ERROR_BACKOFF`].
pub(crate) async fn forward_records<S, E>(source: S, sender: mpsc::Sender<LogRecord>, group: &str)
where
    S: Stream<Item = Result<LogRecord, E>>,
    E: Display,
{
    tokio::pin!(source);
    loop {
        let next = tokio::select! {
            _ = sender.closed() => break,
            next = source.next() => next,
        };
        match next {
            Some(Ok(record)) => {
                if sender.send(record).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(group, error = %e, retry_in = ?CONSUMER_ERROR_BACKOFF, "Log consumer error");
                tokio::select! {
                    _ = sender.closed() => break,
                    _ = tokio::time::sleep(CONSUMER_ERROR_BACKOFF) => {}
                }
            }
            None => break,
        }
    }
    debug!(group, "Log consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_failing_source_is_polled_with_backoff() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let source = futures::stream::repeat_with(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<LogRecord, _>("broker unavailable")
        });
        let (sender, _receiver) = mpsc::channel(4);

        let run = tokio::time::timeout(Duration::from_millis(300), forward_records(source, sender, "g")).await;
        assert!(run.is_err());
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_records_forwarded_until_source_ends() {
        let records = (0..3).map(|offset| {
            Ok::<_, String>(LogRecord {
                topic: "t".to_string(),
                payload: vec![offset as u8],
                offset,
            })
        });
        let (sender, mut receiver) = mpsc::channel(4);
        forward_records(futures::stream::iter(records), sender, "g").await;

        for offset in 0..3 {
            assert_eq!(receiver.recv().await.unwrap().offset, offset);
        }
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_forwarding() {
        let (sender, receiver) = mpsc::channel(1);
        drop(receiver);
        let pending = futures::stream::pending::<Result<LogRecord, String>>();
        tokio::time::timeout(Duration::from_secs(1), forward_records(pending, sender, "g"))
            .await
            .unwrap();
    }
}
