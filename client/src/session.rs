//! One connection's worth of watch party: relay traffic, the local player and
//! the user's own actions, all handled from a single event loop.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::constants::{SyncTimings, SIMULATED_LOAD_LATENCY};
use crate::engine::{LocalSyncState, SyncEngine};
use crate::player::{LocalEvent, PlaybackEngine, ProgramLoader, SimulatedPlayer};
use crate::protocol::{ChatMessage, Message, ProgramId};
use crate::sync::{RoomPublisher, SyncClient};
use crate::utils::format_time;

/// Something the local user asked for
#[derive(Debug)]
pub enum UserCommand {
    Play,
    Pause,
    Seek(f64),
    Load(ProgramId),
    Say(String),
    Status(oneshot::Sender<PartyStatus>),
    Quit,
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq)]
pub struct PartyStatus {
    pub room_id: String,
    pub connected: bool,
    /// Our id in the room, assigned by the relay on join
    pub client_id: Option<Uuid>,
    pub joined: bool,
    pub members: usize,
    pub sync: LocalSyncState,
    pub position: Option<f64>,
    pub playing: bool,
}

#[derive(Debug, Clone)]
pub struct PartyConfig {
    pub room_id: String,
    pub user: String,
    pub timings: SyncTimings,
    /// Program to select once the room is joined
    pub initial_program: Option<ProgramId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Quit,
    Disconnected,
}

/// Loads programs into [`SimulatedPlayer`]s after a short delay
struct SimulatedLoader {
    requests: mpsc::UnboundedSender<ProgramId>,
}

impl ProgramLoader for SimulatedLoader {
    fn load(&self, program: &ProgramId) {
        tracing::debug!("Loading program {}", program);
        if self.requests.send(program.clone()).is_err() {
            tracing::warn!("Session closed; cannot load {}", program);
        }
    }
}

struct SessionState {
    config: PartyConfig,
    engine: SyncEngine,
    client: SyncClient,
    joined: bool,
    members: usize,
}

/// Connect, join the room and run until the user quits or the relay goes away.
/// Every call starts from a blank engine, so a reconnect bootstraps from scratch.
pub async fn run_session(
    client: &SyncClient,
    server_url: &str,
    config: PartyConfig,
    user_input: &mut mpsc::UnboundedReceiver<UserCommand>,
) -> Result<SessionEnd> {
    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<Message>();
    let mut disconnected = client
        .connect(server_url, move |msg| {
            let _ = relay_tx.send(msg);
        })
        .await?;
    tracing::info!("Connected to relay at {}", server_url);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<LocalEvent>();
    let (load_tx, mut load_rx) = mpsc::unbounded_channel::<ProgramId>();
    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<Arc<SimulatedPlayer>>();

    let engine = SyncEngine::new(
        config.room_id.clone(),
        config.timings,
        Arc::new(RoomPublisher::new(client.clone(), config.room_id.clone())),
        Arc::new(SimulatedLoader { requests: load_tx }),
    );
    let mut session = SessionState {
        config,
        engine,
        client: client.clone(),
        joined: false,
        members: 0,
    };

    client.join_room(session.config.room_id.clone())?;

    loop {
        tokio::select! {
            Some(msg) = relay_rx.recv() => session.handle_relay_message(msg),
            Some(event) = event_rx.recv() => session.engine.on_local_event(event),
            Some(program) = load_rx.recv() => {
                let ready_tx = ready_tx.clone();
                let events = event_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(SIMULATED_LOAD_LATENCY).await;
                    let _ = ready_tx.send(Arc::new(SimulatedPlayer::new(program, None, events)));
                });
            }
            Some(player) = ready_rx.recv() => session.engine.on_player_ready(player),
            input = user_input.recv() => match input {
                Some(UserCommand::Quit) | None => {
                    let _ = session.client.leave_room();
                    session.client.clear_room();
                    return Ok(SessionEnd::Quit);
                }
                Some(command) => session.handle_user_command(command),
            },
            _ = &mut disconnected => {
                tracing::warn!("Lost connection to relay");
                session.client.clear_room();
                return Ok(SessionEnd::Disconnected);
            }
        }
    }
}

impl SessionState {
    fn handle_relay_message(&mut self, msg: Message) {
        match msg {
            Message::RoomJoined {
                room_id,
                client_id,
                members,
            } => {
                tracing::info!("Joined room {} as {} ({} members)", room_id, client_id, members);
                self.client.set_room_joined(room_id, client_id);
                self.joined = true;
                self.members = members;
                self.engine.begin_bootstrap();
                if let Some(program) = self.config.initial_program.take() {
                    self.engine.select_program(program);
                }
            }
            Message::ReceiveVideoAction { from_client, command } => {
                tracing::debug!("{} from {}", command.action(), from_client);
                self.engine.handle_remote(command);
            }
            Message::UserJoined { client_id, .. } => {
                tracing::info!("{} joined the party", client_id);
                self.engine.on_peer_joined();
            }
            Message::ReceiveMessage { message, .. } => {
                println!("[{}] {}", message.user, message.text);
            }
            Message::RoomMemberUpdate { room_id, members } => {
                if room_id == self.config.room_id {
                    self.members = members;
                }
            }
            Message::RoomLeft => {
                self.joined = false;
                self.client.clear_room();
            }
            Message::Error { message } => {
                tracing::warn!("Relay error: {}", message);
            }
            other => {
                tracing::warn!("Unexpected message from relay: {:?}", other);
            }
        }
    }

    fn handle_user_command(&mut self, command: UserCommand) {
        let player = self.engine.player();
        match command {
            UserCommand::Play | UserCommand::Pause | UserCommand::Seek(_) if player.is_none() => {
                println!("Nothing is loaded yet");
            }
            UserCommand::Play => with_player(player, |p| p.play()),
            UserCommand::Pause => with_player(player, |p| p.pause()),
            UserCommand::Seek(time) => with_player(player, |p| p.seek(time)),
            UserCommand::Load(program) => self.engine.select_program(program),
            UserCommand::Say(text) => {
                let message = ChatMessage {
                    text,
                    user: self.config.user.clone(),
                };
                if let Err(e) = self.client.send_chat(&self.config.room_id, message) {
                    tracing::warn!("Failed to send chat: {}", e);
                }
            }
            UserCommand::Status(reply) => {
                let status = self.status();
                tracing::debug!(
                    "Status: {:?} at {}",
                    status.sync.current_program,
                    status.position.map(format_time).unwrap_or_default()
                );
                let _ = reply.send(status);
            }
            UserCommand::Quit => {}
        }
    }

    fn status(&self) -> PartyStatus {
        let player = self.engine.player();
        PartyStatus {
            room_id: self.config.room_id.clone(),
            connected: self.client.is_connected(),
            client_id: self.client.client_id(),
            joined: self.joined,
            members: self.members,
            sync: self.engine.state(),
            position: player.as_ref().map(|p| p.current_time()),
            playing: player.as_ref().is_some_and(|p| p.is_playing()),
        }
    }
}

fn with_player<F>(player: Option<Arc<dyn PlaybackEngine>>, action: F)
where
    F: FnOnce(&dyn PlaybackEngine),
{
    if let Some(player) = player {
        action(player.as_ref());
    }
}
