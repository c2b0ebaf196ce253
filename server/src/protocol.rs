use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Playback commands are relayed verbatim; the relay never looks inside them.
pub type PlaybackCommand = serde_json::Value;

/// Messages sent between client and relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    // Client -> Relay
    JoinRoom {
        room_id: String,
    },
    LeaveRoom,
    VideoAction {
        room_id: String,
        command: PlaybackCommand,
    },
    SendMessage {
        room_id: String,
        message: ChatMessage,
    },

    // Relay -> Client
    RoomJoined {
        room_id: String,
        client_id: Uuid,
        members: usize,
    },
    RoomLeft,
    ReceiveVideoAction {
        from_client: Uuid,
        command: PlaybackCommand,
    },
    ReceiveMessage {
        from_client: Uuid,
        message: ChatMessage,
    },
    UserJoined {
        room_id: String,
        client_id: Uuid,
    },
    RoomMemberUpdate {
        room_id: String,
        members: usize,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    pub user: String,
}

/// Client connection metadata
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub room_id: Option<String>,
}

/// Row of the `/rooms` diagnostics listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: String,
    pub members: usize,
}
