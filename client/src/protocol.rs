use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Messages sent between client and relay (must match relay protocol)
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

/// Unit of synchronization traffic. Times are seconds on the sender's clock
/// at emission; transit delay is not compensated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlaybackCommand {
    Play {
        time: f64,
    },
    Pause {
        time: f64,
    },
    Seek {
        time: f64,
    },
    #[serde(rename_all = "camelCase")]
    ChangeProgram {
        program_id: ProgramId,
    },
    #[serde(rename_all = "camelCase")]
    SyncState {
        program_id: ProgramId,
        time: f64,
        is_playing: bool,
    },
    RequestSync,
}

impl PlaybackCommand {
    pub fn action(&self) -> &'static str {
        match self {
            PlaybackCommand::Play { .. } => "play",
            PlaybackCommand::Pause { .. } => "pause",
            PlaybackCommand::Seek { .. } => "seek",
            PlaybackCommand::ChangeProgram { .. } => "change_program",
            PlaybackCommand::SyncState { .. } => "sync_state",
            PlaybackCommand::RequestSync => "request_sync",
        }
    }
}

/// Identity of the movie or episode being watched
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramId(String);

impl ProgramId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity of one episode of a series
    pub fn episode(movie_id: &str, episode: u32) -> Self {
        Self(format!("{movie_id}:{episode}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn movie_id(&self) -> &str {
        match self.0.rsplit_once(':') {
            Some((movie, ep)) if ep.parse::<u32>().is_ok() => movie,
            _ => &self.0,
        }
    }

    pub fn episode_number(&self) -> Option<u32> {
        self.0.rsplit_once(':').and_then(|(_, ep)| ep.parse().ok())
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProgramId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    pub user: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sync_state_uses_camel_case_fields() {
        let command = PlaybackCommand::SyncState {
            program_id: ProgramId::new("tt-42"),
            time: 5.0,
            is_playing: true,
        };
        assert_eq!(
            serde_json::to_value(&command).unwrap(),
            json!({"action": "sync_state", "programId": "tt-42", "time": 5.0, "isPlaying": true})
        );
    }

    #[test]
    fn parses_browser_shaped_commands() {
        let play: PlaybackCommand =
            serde_json::from_value(json!({"action": "play", "time": 12.25})).unwrap();
        assert_eq!(play, PlaybackCommand::Play { time: 12.25 });

        let change: PlaybackCommand =
            serde_json::from_value(json!({"action": "change_program", "programId": "tt-7:3"}))
                .unwrap();
        assert_eq!(
            change,
            PlaybackCommand::ChangeProgram {
                program_id: ProgramId::episode("tt-7", 3)
            }
        );

        let request: PlaybackCommand =
            serde_json::from_value(json!({"action": "request_sync"})).unwrap();
        assert_eq!(request.action(), "request_sync");
    }

    #[test]
    fn unknown_action_is_rejected() {
        let result = serde_json::from_value::<PlaybackCommand>(json!({"action": "rewind"}));
        assert!(result.is_err());
    }

    #[test]
    fn envelope_wraps_command() {
        let msg = Message::VideoAction {
            room_id: "r1".into(),
            command: PlaybackCommand::Pause { time: 3.0 },
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "video_action", "payload": {"room_id": "r1", "command": {"action": "pause", "time": 3.0}}})
        );
    }

    #[test]
    fn program_identity_parts() {
        let episode = ProgramId::episode("tt-7", 3);
        assert_eq!(episode.movie_id(), "tt-7");
        assert_eq!(episode.episode_number(), Some(3));

        let movie = ProgramId::new("tt-42");
        assert_eq!(movie.movie_id(), "tt-42");
        assert_eq!(movie.episode_number(), None);
    }
}
