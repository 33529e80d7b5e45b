//! Inbound half of the RPC transport: accepts connections and serves calls.

use super::frame::{read_frame, write_frame, RpcEnvelope, RpcFrame, RpcFrameKind, WireError};
use crate::inbound::{resolve_routes, router_options, serve_notification, serve_request, served_types, LocalRoute};
use courier_kernel::{DedupCache, Mediator};
use courier_types::config::{DedupConfig, RpcTransportConfig};
use courier_types::envelope::ResponseEnvelope;
use courier_types::error::{CourierError, CourierResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Serves the types it accepts to remote callers.
pub struct RpcListener {
    mediator: Arc<Mediator>,
    /// Routes keyed by canonical type name.
    routes: HashMap<String, LocalRoute>,
    dedup: Option<DedupCache>,
    local_addr: SocketAddr,
    max_frame: usize,
    shutdown: CancellationToken,
}

impl RpcListener {
    /// Bind the configured address and start accepting connections.
    pub async fn start(
        config: &RpcTransportConfig,
        dedup: &DedupConfig,
        mediator: Arc<Mediator>,
    ) -> CourierResult<(Arc<Self>, tokio::task::JoinHandle<()>)> {
        let options = router_options(&mediator)?;
        let names = served_types(&options, &config.accept_types);
        let routes = resolve_routes(&mediator, &options, &names)?
            .into_iter()
            .map(|route| (route.canonical_name.clone(), route))
            .collect::<HashMap<_, _>>();

        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, types = routes.len(), "RPC listener started");

        let node = Arc::new(Self {
            mediator,
            routes,
            dedup: DedupCache::from_config(dedup),
            local_addr,
            max_frame: config.max_message_size,
            shutdown: CancellationToken::new(),
        });

        let accept_node = Arc::clone(&node);
        let handle = tokio::spawn(async move {
            accept_node.accept_loop(listener).await;
        });
        Ok((node, handle))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Open connections end with their peers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Canonical names this listener serves.
    pub fn served_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Serve one request call and return the serialized envelope.
    pub async fn handle_request(&self, call: &RpcEnvelope) -> String {
        let envelope = match self.routes.get(&call.type_name) {
            Some(route) => serve_request(&self.mediator, &route.info, call.body.as_bytes()).await,
            None => {
                warn!(type_name = %call.type_name, "RPC request for a type not served here");
                ResponseEnvelope::from_error(&CourierError::HandlerNotFound(call.type_name.clone()))
            }
        };
        encode_envelope(&envelope)
    }

    /// Serve one notification call. The caller is acknowledged either way.
    pub async fn handle_notification(&self, call: &RpcEnvelope) -> CourierResult<()> {
        let route = self
            .routes
            .get(&call.type_name)
            .ok_or_else(|| CourierError::HandlerNotFound(call.type_name.clone()))?;
        serve_notification(&self.mediator, &route.info, call.body.as_bytes(), self.dedup.as_ref()).await?;
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(addr = %self.local_addr, "RPC listener stopped");
                    return;
                }
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "RPC connection accepted");
                    let node = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = node.connection_loop(stream).await {
                            debug!(peer = %addr, error = %e, "RPC connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "RPC accept error");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn connection_loop(&self, stream: TcpStream) -> Result<(), WireError> {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        loop {
            let frame = match read_frame(&mut reader, self.max_frame).await {
                Ok(frame) => frame,
                Err(WireError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            let reply = self.answer(&frame).await;
            write_frame(&mut writer, &reply).await?;
        }
    }

    async fn answer(&self, frame: &RpcFrame) -> RpcFrame {
        let kind = match &frame.kind {
            RpcFrameKind::HandleRequest(call) => RpcFrameKind::Reply {
                body: self.handle_request(call).await,
            },
            RpcFrameKind::HandleNotification(call) => {
                if let Err(e) = self.handle_notification(call).await {
                    warn!(type_name = %call.type_name, error = %e, "RPC notification failed");
                }
                RpcFrameKind::Ack
            }
            other => {
                warn!(frame = ?other, "Unexpected RPC frame");
                RpcFrameKind::Error {
                    code: 400,
                    message: "expected handle_request or handle_notification".to_string(),
                }
            }
        };
        frame.reply_to(kind)
    }
}

fn encode_envelope(envelope: &ResponseEnvelope) -> String {
    match envelope.to_bytes().map(String::from_utf8) {
        Ok(Ok(text)) => text,
        _ => {
            error!("Response envelope could not be serialized");
            r#"{"content":null,"status":"Exception","exception":{"kind":"Serialization","message":"response could not be serialized"}}"#
                .to_string()
        }
    }
}
