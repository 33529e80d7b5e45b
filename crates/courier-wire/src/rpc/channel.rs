//! Destination channels and clients.
//!
//! An [`RpcChannel`] is the connection state for one destination URI; it keeps
//! a few idle TCP connections for reuse. The [`ChannelPool`] hands out one
//! channel per URI for the life of the process.

use super::frame::{read_frame, write_frame, RpcEnvelope, RpcFrame, RpcFrameKind, WireError};
use courier_types::config::RpcTransportConfig;
use courier_types::envelope::ResponseEnvelope;
use courier_types::error::{CourierError, CourierResult};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// `host:port` part of a destination URI (`tcp://host:port`, `http://host:port`
/// or a bare address).
pub fn socket_addr_of(uri: &str) -> &str {
    let without_scheme = uri.split_once("://").map(|(_, rest)| rest).unwrap_or(uri);
    without_scheme.trim_end_matches('/')
}

/// Connection state for one destination.
pub struct RpcChannel {
    uri: String,
    idle: Mutex<Vec<TcpStream>>,
    max_idle: usize,
    max_frame: usize,
    connect_timeout: Duration,
}

impl RpcChannel {
    pub fn new(uri: impl Into<String>, config: &RpcTransportConfig) -> Self {
        Self {
            uri: uri.into(),
            idle: Mutex::new(Vec::new()),
            max_idle: config.max_idle_connections,
            max_frame: config.max_message_size,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms.max(1)),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn idle_connections(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// One unary exchange: send `frame`, read the frame answering it. A call
    /// is resent on a fresh connection only when it could not be written to
    /// a pooled one; once written it may have run, so a lost reply is an error.
    pub async fn call(&self, frame: &RpcFrame) -> CourierResult<RpcFrame> {
        if let Some(mut stream) = self.checkout() {
            match write_frame(&mut stream, frame).await {
                Ok(()) => return self.read_reply(stream, frame).await,
                Err(e) => debug!(uri = %self.uri, error = %e, "Pooled connection failed before the call was sent"),
            }
        }

        let mut stream = self.connect().await?;
        write_frame(&mut stream, frame).await?;
        self.read_reply(stream, frame).await
    }

    async fn read_reply(&self, mut stream: TcpStream, frame: &RpcFrame) -> CourierResult<RpcFrame> {
        let reply = read_frame(&mut stream, self.max_frame).await?;
        if reply.id != frame.id {
            return Err(WireError::UnexpectedFrame(format!(
                "reply {} does not answer call {}",
                reply.id, frame.id
            ))
            .into());
        }
        self.checkin(stream);
        Ok(reply)
    }

    async fn connect(&self) -> CourierResult<TcpStream> {
        let addr = socket_addr_of(&self.uri);
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                debug!(uri = %self.uri, "Connected");
                Ok(stream)
            }
            Ok(Err(e)) => Err(CourierError::Connection(format!("{}: {e}", self.uri))),
            Err(_) => Err(CourierError::Connection(format!(
                "{}: connect timed out after {:?}",
                self.uri, self.connect_timeout
            ))),
        }
    }

    /// An idle connection the peer has not closed.
    fn checkout(&self) -> Option<TcpStream> {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(stream) = idle.pop() {
            if is_reusable(&stream) {
                return Some(stream);
            }
            debug!(uri = %self.uri, "Discarding closed pooled connection");
        }
        None
    }

    fn checkin(&self, stream: TcpStream) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.max_idle {
            idle.push(stream);
        }
    }
}

/// Whether an idle stream can carry another call: the peer has neither
/// closed it nor sent anything unasked.
fn is_reusable(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    matches!(stream.try_read(&mut buf), Err(e) if e.kind() == std::io::ErrorKind::WouldBlock)
}

/// Typed calls over a channel.
#[derive(Clone)]
pub struct RpcClient {
    channel: Arc<RpcChannel>,
}

impl RpcClient {
    pub fn new(channel: Arc<RpcChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<RpcChannel> {
        &self.channel
    }

    /// Run a remote request and return its envelope.
    pub async fn handle_request(&self, type_name: &str, body: String) -> CourierResult<ResponseEnvelope> {
        let frame = RpcFrame::new(RpcFrameKind::HandleRequest(RpcEnvelope {
            body,
            type_name: type_name.to_string(),
        }));
        match self.channel.call(&frame).await?.kind {
            RpcFrameKind::Reply { body } => ResponseEnvelope::from_bytes(body.as_bytes()),
            RpcFrameKind::Error { code, message } => Err(CourierError::Transport(format!(
                "{} rejected {type_name}: {message} ({code})",
                self.channel.uri()
            ))),
            other => Err(CourierError::Transport(format!(
                "unexpected answer to request: {other:?}"
            ))),
        }
    }

    /// Deliver a notification; only a rejected call is an error.
    pub async fn handle_notification(&self, type_name: &str, body: String) -> CourierResult<()> {
        let frame = RpcFrame::new(RpcFrameKind::HandleNotification(RpcEnvelope {
            body,
            type_name: type_name.to_string(),
        }));
        match self.channel.call(&frame).await?.kind {
            RpcFrameKind::Error { code, message } => Err(CourierError::Transport(format!(
                "{} rejected {type_name}: {message} ({code})",
                self.channel.uri()
            ))),
            _ => Ok(()),
        }
    }
}

/// One channel per destination URI.
pub struct ChannelPool {
    channels: DashMap<String, Arc<RpcChannel>>,
    config: RpcTransportConfig,
}

impl ChannelPool {
    pub fn new(config: RpcTransportConfig) -> Self {
        Self {
            channels: DashMap::new(),
            config,
        }
    }

    /// The channel for `uri`, created on first use.
    pub fn get_or_create(&self, uri: &str) -> Arc<RpcChannel> {
        if let Some(existing) = self.channels.get(uri) {
            return existing.clone();
        }
        self.channels
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(RpcChannel::new(uri, &self.config)))
            .clone()
    }

    /// Every known destination.
    pub fn channels(&self) -> Vec<Arc<RpcChannel>> {
        self.channels.iter().map(|c| c.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr_of() {
        assert_eq!(socket_addr_of("tcp://10.0.0.1:7400"), "10.0.0.1:7400");
        assert_eq!(socket_addr_of("http://svc:80/"), "svc:80");
        assert_eq!(socket_addr_of("127.0.0.1:9"), "127.0.0.1:9");
    }

    #[test]
    fn test_pool_returns_same_channel() {
        let pool = ChannelPool::new(RpcTransportConfig::default());
        let a = pool.get_or_create("tcp://127.0.0.1:1");
        let b = pool.get_or_create("tcp://127.0.0.1:1");
        let c = pool.get_or_create("tcp://127.0.0.1:2");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let channel = RpcChannel::new(format!("tcp://{addr}"), &RpcTransportConfig::default());
        let err = channel.call(&RpcFrame::new(RpcFrameKind::Ack)).await.unwrap_err();
        assert!(matches!(err, CourierError::Connection(_)));
    }

    /// Accepts connections and reads one frame from each, answering it with
    /// an ack when `reply` is set, then closes the connection.
    async fn one_frame_server(reply: bool) -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("tcp://{}", listener.local_addr().unwrap());
        let frames = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&frames);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let Ok(frame) = read_frame(&mut stream, 1024).await else {
                    continue;
                };
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if reply {
                    let _ = write_frame(&mut stream, &frame.reply_to(RpcFrameKind::Ack)).await;
                }
            }
        });
        (uri, frames)
    }

    #[tokio::test]
    async fn test_call_is_not_resent_after_reply_is_lost() {
        let (uri, frames) = one_frame_server(false).await;
        let channel = RpcChannel::new(uri, &RpcTransportConfig::default());

        let err = channel.call(&RpcFrame::new(RpcFrameKind::Ack)).await.unwrap_err();
        assert!(matches!(err, CourierError::Connection(_)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(frames.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(channel.idle_connections(), 0);
    }

    #[tokio::test]
    async fn test_closed_pooled_connection_is_replaced() {
        let (uri, frames) = one_frame_server(true).await;
        let channel = RpcChannel::new(uri, &RpcTransportConfig::default());

        channel.call(&RpcFrame::new(RpcFrameKind::Ack)).await.unwrap();
        assert_eq!(channel.idle_connections(), 1);
        // Let the server's close reach the pooled stream.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let frame = RpcFrame::new(RpcFrameKind::Ack);
        let reply = channel.call(&frame).await.unwrap();
        assert_eq!(reply.id, frame.id);
        assert_eq!(frames.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
