use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use crate::constants::KEEPALIVE_INTERVAL;
use crate::engine::CommandSink;
use crate::protocol::{ChatMessage, Message, PlaybackCommand};

/// Websocket connection to the relay
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<SyncClientState>,
}

struct SyncClientState {
    tx: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    room_id: Mutex<Option<String>>,
    client_id: Mutex<Option<Uuid>>,
}

impl Default for SyncClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SyncClientState {
                tx: Mutex::new(None),
                room_id: Mutex::new(None),
                client_id: Mutex::new(None),
            }),
        }
    }

    /// Connect to the relay. Returns a receiver that resolves when the socket closes.
    pub async fn connect<F>(&self, server_url: &str, on_message: F) -> Result<oneshot::Receiver<()>>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let (ws_stream, _) = connect_async(server_url)
            .await
            .context("Failed to connect to relay")?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.inner.tx.lock() = Some(tx);

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let disconnect_signal = Arc::new(Mutex::new(Some(disconnect_tx)));

        // Sender task
        let send_inner = Arc::clone(&self.inner);
        let send_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            send_inner.clear_transport();
            if let Some(tx) = send_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        let handler = Arc::new(on_message);
        let recv_inner = Arc::clone(&self.inner);
        let recv_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<Message>(&text) {
                        Ok(parsed) => handler(parsed),
                        Err(e) => tracing::warn!("Ignoring unreadable relay message: {}", e),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        tracing::warn!("Relay connection error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            recv_inner.clear_transport();
            if let Some(tx) = recv_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        // Keep-alive pings
        let ping_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                sleep(KEEPALIVE_INTERVAL).await;
                if ping_inner.enqueue_ws(WsMessage::Ping(Vec::new().into())).is_err() {
                    break;
                }
            }
        });

        Ok(disconnect_rx)
    }

    pub fn join_room(&self, room_id: String) -> Result<()> {
        self.send_message(Message::JoinRoom { room_id })
    }

    pub fn leave_room(&self) -> Result<()> {
        self.send_message(Message::LeaveRoom)
    }

    pub fn send_video_action(&self, room_id: &str, command: PlaybackCommand) -> Result<()> {
        self.send_message(Message::VideoAction {
            room_id: room_id.to_string(),
            command,
        })
    }

    pub fn send_chat(&self, room_id: &str, message: ChatMessage) -> Result<()> {
        self.send_message(Message::SendMessage {
            room_id: room_id.to_string(),
            message,
        })
    }

    /// Update room state after the relay confirms the join
    pub fn set_room_joined(&self, room_id: String, client_id: Uuid) {
        *self.inner.room_id.lock() = Some(room_id);
        *self.inner.client_id.lock() = Some(client_id);
    }

    pub fn clear_room(&self) {
        *self.inner.room_id.lock() = None;
        *self.inner.client_id.lock() = None;
    }

    pub fn client_id(&self) -> Option<Uuid> {
        *self.inner.client_id.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.tx.lock().is_some()
    }

    fn send_message(&self, msg: Message) -> Result<()> {
        let json = serde_json::to_string(&msg).context("Failed to serialize message")?;
        self.inner
            .enqueue_ws(WsMessage::Text(json.into()))
            .map_err(|_| anyhow::anyhow!("Not connected to relay"))
    }
}

impl SyncClientState {
    fn clear_transport(&self) {
        *self.tx.lock() = None;
    }

    fn enqueue_ws(&self, message: WsMessage) -> Result<(), ()> {
        if let Some(tx) = self.tx.lock().clone() {
            tx.send(message).map_err(|_| ())
        } else {
            Err(())
        }
    }
}

/// Publishes an engine's commands into one room over the relay
pub struct RoomPublisher {
    client: SyncClient,
    room_id: String,
}

impl RoomPublisher {
    pub fn new(client: SyncClient, room_id: impl Into<String>) -> Self {
        Self {
            client,
            room_id: room_id.into(),
        }
    }
}

impl CommandSink for RoomPublisher {
    fn publish(&self, command: PlaybackCommand) -> Result<()> {
        tracing::debug!("Publishing {} to room {}", command.action(), self.room_id);
        self.client
            .send_video_action(&self.room_id, command)
            .with_context(|| format!("Failed to publish to room {}", self.room_id))
    }
}
