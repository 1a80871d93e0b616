//! WebSocket front end.
//!
//! Every accepted socket becomes one registry connection. Text messages
//! from the client are control messages; everything the core pushes
//! (events as text, frames as binary) goes through a per-client
//! `ChannelSink` drained by a writer task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use camstream_core::{
    ChannelSink, ConnectionRegistry, ControlMessage, FrameSink, OutboundMessage, ServerEvent,
    StreamError,
};

use crate::config::ServerConfig;

// ── StreamServer ─────────────────────────────────────────────────

/// The top-level streaming service.
pub struct StreamServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    running: Arc<AtomicBool>,
}

impl StreamServer {
    pub fn new(config: ServerConfig, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            config,
            registry,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Bind the configured address and serve until stopped.
    pub async fn run(&self) -> Result<(), StreamError> {
        let addr: SocketAddr = self
            .config
            .network
            .bind
            .parse()
            .map_err(|e| StreamError::Other(format!("invalid bind address: {e}")))?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until stopped, then stop
    /// every stream.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), StreamError> {
        self.running.store(true, Ordering::SeqCst);
        info!("streaming server listening on {}", listener.local_addr()?);

        while self.running.load(Ordering::SeqCst) {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = Self::wait_for_stop(&self.running) => break,
            };

            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            if self.registry.connection_count().await >= self.config.network.max_connections {
                warn!("rejecting {peer}: connection limit reached");
                continue;
            }

            let registry = Arc::clone(&self.registry);
            let buffer = self.config.network.outbound_buffer;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, registry, buffer).await {
                    debug!("connection from {peer} ended with error: {e}");
                }
            });
        }

        self.registry.shutdown().await;
        self.running.store(false, Ordering::SeqCst);
        info!("streaming server stopped");
        Ok(())
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

// ── Per-connection ───────────────────────────────────────────────

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    buffer: usize,
) -> Result<(), StreamError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| StreamError::TransportFailure(format!("handshake with {peer}: {e}")))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (sink, mut rx) = ChannelSink::channel(buffer);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match msg {
                OutboundMessage::Binary(bytes) => WsMessage::Binary(bytes.to_vec()),
                OutboundMessage::Text(text) => WsMessage::Text(text),
            };
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let id = registry.connect(Arc::new(sink.clone())).await;
    info!(connection = %id, "websocket client {peer} connected");

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => match ControlMessage::parse(&text) {
                Ok(control) => {
                    if let Err(e) = registry.handle(id, control).await {
                        debug!(connection = %id, "control message rejected: {e}");
                    }
                }
                Err(e) => {
                    warn!(connection = %id, "malformed control message: {e}");
                    // Best effort: the writer may already be gone.
                    let _ = sink.send_event(&ServerEvent::error(&e)).await;
                }
            },
            Ok(WsMessage::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    registry.disconnect(id).await?;
    drop(sink);
    if tokio::time::timeout(Duration::from_secs(2), send_task).await.is_err() {
        debug!(connection = %id, "writer did not drain in time");
    }
    info!(connection = %id, "websocket client {peer} disconnected");
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use camstream_core::{CodecTable, DefaultCodecFactory, SharedCapture, SyntheticSource};

    fn server() -> StreamServer {
        let config = ServerConfig::default();
        let registry = ConnectionRegistry::new(
            SharedCapture::new(Arc::new(SyntheticSource::new())),
            Arc::new(CodecTable::fallback_only()),
            Arc::new(DefaultCodecFactory::default()),
            config.to_registry_options(),
        );
        StreamServer::new(config, Arc::new(registry))
    }

    #[test]
    fn service_creates_with_defaults() {
        let svc = server();
        assert!(!svc.is_running());
    }

    #[test]
    fn stop_handle_works() {
        let svc = server();
        let handle = svc.stop_handle();
        handle.store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn serve_returns_after_stop() {
        let svc = Arc::new(server());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let task = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.serve(listener).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(svc.is_running());
        svc.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
