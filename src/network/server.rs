//! WebSocket Replication Server
//!
//! Accepts WebSocket connections, authenticates the first message and then
//! hands every frame to the shared [`ServerRuntime`]. Each connection owns
//! one writer task draining the player's outbound queue.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::core::ids::PlayerId;
use crate::network::auth::{authenticate, AuthConfig};
use crate::network::protocol::{
    AuthResult, ClientMessage, ErrorCode, ServerError, ServerMessage,
};
use crate::runtime::ServerRuntime;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How long a new connection has to authenticate.
    pub auth_timeout: Duration,
    /// Server version string.
    pub version: String,
    /// Token validation.
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            auth_timeout: Duration::from_secs(10),
            version: env!("CARGO_PKG_VERSION").to_string(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create config from `SHARED_COMPONENTS_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("SHARED_COMPONENTS_BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("SHARED_COMPONENTS_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            auth_timeout: std::env::var("SHARED_COMPONENTS_AUTH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.auth_timeout),
            version: defaults.version,
            auth: AuthConfig::from_env(),
        }
    }
}

/// Replication server errors.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The first message was not a valid authentication.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// No authentication within the deadline.
    #[error("Authentication timed out")]
    AuthTimeout,

    /// Connection closed before authenticating.
    #[error("Connection closed")]
    Closed,
}

/// The WebSocket front of a [`ServerRuntime`].
pub struct ReplicationServer {
    config: ServerConfig,
    runtime: Arc<Mutex<ServerRuntime>>,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ReplicationServer {
    /// Create a server in front of `runtime`.
    pub fn new(config: ServerConfig, runtime: Arc<Mutex<ServerRuntime>>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            runtime,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Runtime shared with the connection tasks.
    pub fn runtime(&self) -> Arc<Mutex<ServerRuntime>> {
        Arc::clone(&self.runtime)
    }

    /// Live connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind to the configured address and serve until shutdown.
    #[instrument(skip(self), fields(addr = %self.config.bind_addr))]
    pub async fn run(&self) -> Result<(), ReplicationServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ReplicationServerError> {
        info!("Replication server listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connection_count() >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            info!("New connection from {}", addr);
                            self.spawn_connection(stream, addr);
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let runtime = Arc::clone(&self.runtime);
        let config = self.config.clone();
        let connections = Arc::clone(&self.connections);
        let shutdown_rx = self.shutdown_tx.subscribe();

        connections.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, runtime, config, shutdown_rx).await {
                debug!("Connection {} ended: {}", addr, e);
            }
            connections.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

#[instrument(skip_all, fields(%addr))]
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    runtime: Arc<Mutex<ServerRuntime>>,
    config: ServerConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ReplicationServerError> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let player = match tokio::time::timeout(config.auth_timeout, ws_receiver.next()).await {
        Err(_) => {
            send_error(&mut ws_sender, ErrorCode::NotAuthenticated, "authentication timed out").await;
            return Err(ReplicationServerError::AuthTimeout);
        }
        Ok(None) => return Err(ReplicationServerError::Closed),
        Ok(Some(frame)) => match read_auth(frame?, &config) {
            Ok(player) => player,
            Err(reason) => {
                send_auth_result(&mut ws_sender, &config, Err(reason.clone())).await;
                return Err(ReplicationServerError::AuthFailed(reason));
            }
        },
    };

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<ServerMessage>();
    {
        let mut rt = runtime.lock().await;
        if rt.is_joined(&player) {
            drop(rt);
            let reason = "player already connected".to_string();
            send_auth_result(&mut ws_sender, &config, Err(reason.clone())).await;
            return Err(ReplicationServerError::AuthFailed(reason));
        }
        let _ = msg_tx.send(auth_result(&config, Ok(player)));
        if let Err(e) = rt.player_joined(player, msg_tx.clone()) {
            return Err(ReplicationServerError::AuthFailed(e.to_string()));
        }
    }
    info!("Client {} authenticated as {}", addr, player);

    let writer = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            let text = match msg.to_json() {
                Ok(t) => t,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                        Ok(message) => runtime.lock().await.handle_client_message(player, message),
                        Err(e) => {
                            debug!("Invalid message from {}: {}", addr, e);
                            let _ = msg_tx.send(ServerMessage::Error(ServerError {
                                code: ErrorCode::InvalidMessage,
                                message: "Invalid message format".to_string(),
                            }));
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client {} disconnected", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error for {}: {}", addr, e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = msg_tx.send(ServerMessage::Shutdown {
                    reason: "Server shutting down".to_string(),
                });
                break;
            }
        }
    }

    runtime.lock().await.player_left(&player);
    drop(msg_tx);
    // The runtime dropped its sender in player_left, so the writer drains and exits.
    let _ = writer.await;
    info!("Client {} cleaned up", addr);
    Ok(())
}

fn read_auth(frame: Message, config: &ServerConfig) -> Result<PlayerId, String> {
    let text = match frame {
        Message::Text(text) => text,
        _ => return Err("expected a text auth message".into()),
    };
    match ClientMessage::from_json(&text) {
        Ok(ClientMessage::Auth(request)) => {
            authenticate(&request, &config.auth).map_err(|e| e.to_string())
        }
        Ok(_) => Err("must authenticate first".into()),
        Err(e) => Err(format!("invalid auth message: {}", e)),
    }
}

fn auth_result(config: &ServerConfig, outcome: Result<PlayerId, String>) -> ServerMessage {
    let (success, player_id, error) = match outcome {
        Ok(player) => (true, Some(player.to_uuid_string()), None),
        Err(reason) => (false, None, Some(reason)),
    };
    ServerMessage::AuthResult(AuthResult {
        success,
        player_id,
        error,
        server_version: config.version.clone(),
    })
}

async fn send_auth_result(sink: &mut WsSink, config: &ServerConfig, outcome: Result<PlayerId, String>) {
    send_direct(sink, &auth_result(config, outcome)).await;
}

async fn send_error(sink: &mut WsSink, code: ErrorCode, message: &str) {
    let error = ServerMessage::Error(ServerError { code, message: message.to_string() });
    send_direct(sink, &error).await;
}

async fn send_direct(sink: &mut WsSink, message: &ServerMessage) {
    match message.to_json() {
        Ok(text) => {
            let _ = sink.send(Message::Text(text)).await;
            let _ = sink.close().await;
        }
        Err(e) => error!("Failed to serialize message: {}", e),
    }
}

// =============================================================================
// TESTS
// =============================================================================
