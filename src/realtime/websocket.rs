//! # WebSocket Server
//!
//! Accepts connections, picks the framing from the upgrade path and pumps
//! frames between the socket and a `DdpSession`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, Interval};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::ddp::{Encapsulation, ServerMessage};

use super::errors::{RealtimeError, RealtimeResult};
use super::interface::DdpInterface;
use super::session::DdpSession;

/// SockJS close code sent when the server goes away
const GOING_AWAY_CODE: u16 = 3000;

/// WebSocket server configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Bind address
    pub bind_addr: String,

    /// Interval between server `ping` messages, 0 disables
    pub heartbeat_interval_secs: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            heartbeat_interval_secs: 30,
        }
    }
}

/// WebSocket server
pub struct WebSocketServer {
    config: WebSocketConfig,
    interface: Arc<DdpInterface>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: WebSocketConfig, interface: Arc<DdpInterface>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            interface,
            shutdown_tx,
        }
    }

    /// Bind and serve until `shutdown` is called
    pub async fn run(&self) -> RealtimeResult<()> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| RealtimeError::ConfigError(format!("Invalid bind address: {}", e)))?;

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RealtimeError::ConfigError(format!("Failed to bind: {}", e)))?;

        info!(%addr, "websocket server listening");
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> RealtimeResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let interface = Arc::clone(&self.interface);
                            let config = self.config.clone();
                            let shutdown = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    peer_addr,
                                    interface,
                                    config,
                                    shutdown,
                                ).await {
                                    warn!(%peer_addr, error = %e, "websocket connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("websocket server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a single WebSocket connection
    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        interface: Arc<DdpInterface>,
        config: WebSocketConfig,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> RealtimeResult<()> {
        let mut selected = None;
        let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
            match Encapsulation::from_path(request.uri().path()) {
                Some(encapsulation) => {
                    selected = Some(encapsulation);
                    Ok(response)
                }
                None => {
                    let mut rejection = ErrorResponse::new(Some("Unknown path".to_string()));
                    *rejection.status_mut() = StatusCode::NOT_FOUND;
                    Err(rejection)
                }
            }
        })
        .await
        .map_err(|e| RealtimeError::ConnectionError(format!("WebSocket handshake failed: {}", e)))?;

        let encapsulation = selected
            .ok_or_else(|| RealtimeError::ConnectionError("No framing selected".to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (session, mut outbound) = DdpSession::new(interface, encapsulation);
        info!(session = %session.id(), %peer_addr, ?encapsulation, "new websocket connection");

        if let Some(open) = encapsulation.open_frame() {
            ws_sender
                .send(Message::Text(open))
                .await
                .map_err(|e| RealtimeError::ConnectionError(e.to_string()))?;
        }

        let mut heartbeat = heartbeat_timer(config.heartbeat_interval_secs);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => session.handle_frame(&text),
                        Some(Ok(Message::Binary(_))) => {
                            debug!(session = %session.id(), "ignoring binary frame");
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(session = %session.id(), "connection closed by peer");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(session = %session.id(), error = %e, "websocket receive error");
                            break;
                        }
                        _ => {}
                    }
                }

                batch = outbound.recv() => {
                    let Some(batch) = batch else {
                        break;
                    };
                    let frames = match encapsulation.encode_server(&batch) {
                        Ok(frames) => frames,
                        Err(e) => {
                            error!(session = %session.id(), error = %e, "failed to encode batch");
                            continue;
                        }
                    };
                    let mut failed = false;
                    for frame in frames {
                        if let Err(e) = ws_sender.send(Message::Text(frame)).await {
                            warn!(session = %session.id(), error = %e, "failed to send frame");
                            failed = true;
                            break;
                        }
                    }
                    if failed {
                        break;
                    }
                }

                _ = async {
                    match heartbeat.as_mut() {
                        Some(timer) => { timer.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    session.send(vec![ServerMessage::Ping { id: None }]);
                }

                _ = shutdown_rx.recv() => {
                    if let Some(close) = encapsulation.close_frame(GOING_AWAY_CODE, "Go away!") {
                        let _ = ws_sender.send(Message::Text(close)).await;
                    }
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        session.close();
        info!(session = %session.id(), %peer_addr, "connection cleaned up");
        Ok(())
    }

    /// Stop accepting and close open connections
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Number of open sessions
    pub fn connection_count(&self) -> usize {
        self.interface.session_count()
    }
}

fn heartbeat_timer(secs: u64) -> Option<Interval> {
    if secs == 0 {
        return None;
    }
    let period = Duration::from_secs(secs);
    Some(interval_at(Instant::now() + period, period))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_zero_interval_disables_heartbeat() {
        assert!(heartbeat_timer(0).is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_does_not_fire_immediately() {
        let mut timer = heartbeat_timer(30).unwrap();
        let fired = tokio::time::timeout(Duration::from_millis(20), timer.tick()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_run_rejects_bad_address() {
        let server = WebSocketServer::new(
            WebSocketConfig {
                bind_addr: "not an address".to_string(),
                heartbeat_interval_secs: 0,
            },
            Arc::new(DdpInterface::new()),
        );
        assert!(matches!(server.run().await, Err(RealtimeError::ConfigError(_))));
    }
}
