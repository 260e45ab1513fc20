//! WebSocket Client Connector
//!
//! Connects a [`ClientRuntime`] to a replication server: authenticates,
//! then pumps outbound requests and inbound messages on two tasks.
//!
//! Pending calls are awaited outside the runtime lock:
//!
//! ```ignore
//! let pending = connection.runtime().lock().await.invoke(key, "buy", args)?;
//! let reply = pending.wait().await?;
//! ```

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::config::RuntimeConfig;
use crate::core::ids::PlayerId;
use crate::network::protocol::{AuthRequest, ClientMessage, ServerMessage};
use crate::registry::Registry;
use crate::runtime::ClientRuntime;

/// Connector errors.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// Message could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The server refused the credentials.
    #[error("Authentication rejected: {0}")]
    Rejected(String),
    /// No auth reply in time.
    #[error("Authentication timed out")]
    Timeout,
    /// The server closed before replying.
    #[error("Connection closed")]
    Closed,
}

/// An authenticated connection driving a [`ClientRuntime`].
pub struct ClientConnection {
    player: PlayerId,
    runtime: Arc<Mutex<ClientRuntime>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientConnection {
    /// Player id the server assigned.
    pub fn player(&self) -> PlayerId {
        self.player
    }

    /// Runtime fed by this connection.
    pub fn runtime(&self) -> Arc<Mutex<ClientRuntime>> {
        Arc::clone(&self.runtime)
    }

    /// True while the server side is still open.
    pub fn is_open(&self) -> bool {
        !self.reader.is_finished()
    }

    /// Close the connection.
    pub fn close(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("player", &self.player)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Connect to `url` and authenticate with `token` (empty for anonymous).
#[instrument(skip(token, registry, config))]
pub async fn connect(
    url: &str,
    token: &str,
    registry: Arc<Registry>,
    config: RuntimeConfig,
) -> Result<ClientConnection, ConnectError> {
    let (ws_stream, _) = connect_async(url).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let auth = ClientMessage::Auth(AuthRequest {
        token: token.to_string(),
        client_version: env!("CARGO_PKG_VERSION").to_string(),
    });
    ws_sender.send(Message::Text(auth.to_json()?)).await?;

    let result = tokio::time::timeout(config.call_timeout, async {
        while let Some(frame) = ws_receiver.next().await {
            if let Message::Text(text) = frame? {
                match ServerMessage::from_json(&text)? {
                    ServerMessage::AuthResult(result) => return Ok(result),
                    other => debug!("Ignoring {:?} before auth", other),
                }
            }
        }
        Err(ConnectError::Closed)
    })
    .await
    .map_err(|_| ConnectError::Timeout)??;

    if !result.success {
        return Err(ConnectError::Rejected(result.error.unwrap_or_default()));
    }
    let player = result
        .player_id
        .as_deref()
        .and_then(PlayerId::from_uuid_str)
        .ok_or_else(|| ConnectError::Rejected("no player id in auth result".into()))?;
    info!("Connected to {} as {} (server {})", url, player, result.server_version);

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let runtime = Arc::new(Mutex::new(ClientRuntime::new(registry, config, msg_tx)));

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
    });

    let inbound = Arc::clone(&runtime);
    let reader = tokio::spawn(async move {
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                    Ok(message) => inbound.lock().await.handle_server_message(message),
                    Err(e) => warn!("Invalid message from server: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
            }
        }
        debug!("Server connection closed");
    });

    Ok(ClientConnection { player, runtime, reader, writer })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::descriptor::{ComponentDescriptor, SyncScope};
    use crate::core::ids::InstanceHandle;
    use crate::network::auth::AuthConfig;
    use crate::network::server::{ReplicationServer, ServerConfig};
    use crate::runtime::ServerRuntime;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;

    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    struct Counter;

    fn registry() -> Arc<Registry> {
        let counter = ComponentDescriptor::builder::<Counter>("Counter")
            .initial_state(json!({ "count": 0 }))
            .sync_scope(SyncScope::Started)
            .build();
        Registry::builder().component(counter).build()
    }

    async fn wait_for<F>(runtime: &Arc<Mutex<ClientRuntime>>, mut check: F)
    where
        F: FnMut(&ClientRuntime) -> bool,
    {
        for _ in 0..200 {
            if check(&*runtime.lock().await) {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_connect_mirrors_and_hydrates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_runtime = Arc::new(Mutex::new(ServerRuntime::new(registry(), RuntimeConfig::default())));
        let key = server_runtime.lock().await.add::<Counter>(InstanceHandle(7)).unwrap();

        let config = ServerConfig {
            auth: AuthConfig { allow_anonymous: true, ..Default::default() },
            ..Default::default()
        };
        let server = Arc::new(ReplicationServer::new(config, Arc::clone(&server_runtime)));
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });

        let connection = connect(&format!("ws://{}", addr), "", registry(), RuntimeConfig::default())
            .await
            .unwrap();
        let runtime = connection.runtime();

        wait_for(&runtime, |rt| {
            rt.store().iter().any(|c| c.is_ready() && c.state()["count"] == json!(0))
        })
        .await;

        server_runtime.lock().await.dispatch(key, json!({ "count": 5 })).unwrap();
        wait_for(&runtime, |rt| rt.store().iter().any(|c| c.state()["count"] == json!(5))).await;

        server.shutdown();
        connection.close();
    }

    #[tokio::test]
    async fn test_connect_rejected_without_token() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_runtime = Arc::new(Mutex::new(ServerRuntime::new(registry(), RuntimeConfig::default())));
        let server = Arc::new(ReplicationServer::new(ServerConfig::default(), server_runtime));
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });

        let err = connect(&format!("ws://{}", addr), "", registry(), RuntimeConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Rejected(_)));
    }
}
