//! Sync Engine
//!
//! Per-room state machine that keeps the local player in step with the rest
//! of the room. Local user actions become [`PlaybackCommand`]s; commands from
//! peers are applied to the player under a suppression window so the player
//! events they cause are not echoed back to the room.

mod presence;

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::constants::SyncTimings;
use crate::player::{LocalEvent, PlaybackEngine, ProgramLoader};
use crate::protocol::{PlaybackCommand, ProgramId};

/// Outbound side of the engine: delivers commands to the rest of the room
pub trait CommandSink: Send + Sync {
    fn publish(&self, command: PlaybackCommand) -> anyhow::Result<()>;
}

/// Position to restore once a program that is still loading becomes ready
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingReconciliation {
    pub time: f64,
    pub is_playing: bool,
}

/// What this client believes about the room
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalSyncState {
    pub current_program: Option<ProgramId>,
    /// While set, local player events are consequences of a remote command
    pub suppressed: bool,
    pub pending_reconciliation: Option<PendingReconciliation>,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    room_id: String,
    timings: SyncTimings,
    state: Mutex<EngineState>,
    sink: Arc<dyn CommandSink>,
    loader: Arc<dyn ProgramLoader>,
}

#[derive(Default)]
struct EngineState {
    sync: LocalSyncState,
    /// Bumped on every remote application; only the newest grace timer may lift suppression
    suppression_epoch: u64,
    player: Option<Arc<dyn PlaybackEngine>>,
}

impl EngineState {
    fn suppress(&mut self) -> u64 {
        self.sync.suppressed = true;
        self.suppression_epoch += 1;
        self.suppression_epoch
    }
}

impl SyncEngine {
    pub fn new(
        room_id: impl Into<String>,
        timings: SyncTimings,
        sink: Arc<dyn CommandSink>,
        loader: Arc<dyn ProgramLoader>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                room_id: room_id.into(),
                timings,
                state: Mutex::new(EngineState::default()),
                sink,
                loader,
            }),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn state(&self) -> LocalSyncState {
        self.inner.state.lock().sync.clone()
    }

    pub fn current_program(&self) -> Option<ProgramId> {
        self.inner.state.lock().sync.current_program.clone()
    }

    /// The player of the current program, once it has finished loading
    pub fn player(&self) -> Option<Arc<dyn PlaybackEngine>> {
        self.inner.state.lock().player.clone()
    }

    /// A play, pause or seek observed on the local player
    pub fn on_local_event(&self, event: LocalEvent) {
        if self.inner.state.lock().sync.suppressed {
            tracing::debug!("Discarding {:?} caused by a remote command", event);
            return;
        }

        let command = match event {
            LocalEvent::Play { time } => PlaybackCommand::Play { time },
            LocalEvent::Pause { time } => PlaybackCommand::Pause { time },
            LocalEvent::Seek { time } => PlaybackCommand::Seek { time },
        };
        self.publish(command);
    }

    /// Load a program locally and announce it to the room
    pub fn select_program(&self, program: ProgramId) {
        if self.current_program().as_ref() == Some(&program) {
            tracing::debug!("Program {} already selected; re-announcing", program);
        } else {
            self.begin_load(program.clone(), None);
        }
        self.publish(PlaybackCommand::ChangeProgram {
            program_id: program,
        });
    }

    /// A command relayed from another member of the room
    pub fn handle_remote(&self, command: PlaybackCommand) {
        tracing::debug!("Applying remote {} in room {}", command.action(), self.room_id());
        let tolerance = self.inner.timings.drift_tolerance_secs;

        match command {
            PlaybackCommand::Play { time } => {
                self.apply_remote(|player| {
                    if (player.current_time() - time).abs() > tolerance {
                        player.seek(time);
                    }
                    player.play();
                });
            }
            PlaybackCommand::Pause { time } => {
                self.apply_remote(|player| {
                    player.seek(time);
                    player.pause();
                });
            }
            PlaybackCommand::Seek { time } => {
                self.apply_remote(|player| player.seek(time));
            }
            PlaybackCommand::ChangeProgram { program_id } => {
                if self.current_program().as_ref() == Some(&program_id) {
                    tracing::debug!("Already on program {}; ignoring change", program_id);
                } else {
                    tracing::info!("Room switched to program {}", program_id);
                    self.begin_load(program_id, None);
                }
            }
            PlaybackCommand::SyncState {
                program_id,
                time,
                is_playing,
            } => self.reconcile(program_id, time, is_playing),
            PlaybackCommand::RequestSync => self.answer_sync_request(),
        }
    }

    /// The player for a newly loaded program is ready for use
    pub fn on_player_ready(&self, player: Arc<dyn PlaybackEngine>) {
        let has_pending = {
            let mut state = self.inner.state.lock();
            if state.sync.current_program.as_ref() != Some(player.program()) {
                tracing::debug!(
                    "Ignoring ready player for {}; room moved on",
                    player.program()
                );
                return;
            }
            state.player = Some(Arc::clone(&player));
            state.sync.pending_reconciliation.is_some()
        };

        tracing::info!("Program {} ready", player.program());
        if !has_pending {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let settle = self.inner.timings.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            if let Some(inner) = weak.upgrade() {
                SyncEngine { inner }.apply_pending(&player);
            }
        });
    }

    fn reconcile(&self, program: ProgramId, time: f64, is_playing: bool) {
        let pending = PendingReconciliation { time, is_playing };

        if self.current_program().as_ref() != Some(&program) {
            tracing::info!(
                "Room is on program {}; loading it before restoring {:.1}s",
                program,
                time
            );
            self.begin_load(program, Some(pending));
            return;
        }

        let applied = self.apply_remote(|player| restore(player, pending));
        if !applied {
            // Same program, still loading: let readiness apply it
            self.inner.state.lock().sync.pending_reconciliation = Some(pending);
        }
    }

    fn apply_pending(&self, expected: &Arc<dyn PlaybackEngine>) {
        let (pending, epoch) = {
            let mut state = self.inner.state.lock();
            let attached = state
                .player
                .as_ref()
                .is_some_and(|player| Arc::ptr_eq(player, expected));
            if !attached {
                return;
            }
            let Some(pending) = state.sync.pending_reconciliation.take() else {
                return;
            };
            (pending, state.suppress())
        };

        tracing::info!(
            "Restoring {} at {:.1}s ({})",
            expected.program(),
            pending.time,
            if pending.is_playing { "playing" } else { "paused" }
        );
        restore(expected.as_ref(), pending);
        self.schedule_release(epoch);
    }

    /// Runs `apply` against the player with echoes suppressed. Returns false
    /// when there is no player to apply to.
    ///
    /// A command applied here supersedes any pending reconciliation still
    /// waiting out the settle delay.
    fn apply_remote<F>(&self, apply: F) -> bool
    where
        F: FnOnce(&dyn PlaybackEngine),
    {
        let (player, epoch) = {
            let mut state = self.inner.state.lock();
            let Some(player) = state.player.clone() else {
                tracing::debug!("No player attached; dropping remote command");
                return false;
            };
            if state.sync.pending_reconciliation.take().is_some() {
                tracing::debug!("Newer remote command replaces pending restore");
            }
            (player, state.suppress())
        };

        apply(player.as_ref());
        self.schedule_release(epoch);
        true
    }

    fn schedule_release(&self, epoch: u64) {
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let grace = self.inner.timings.suppression_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock();
                if state.suppression_epoch == epoch {
                    state.sync.suppressed = false;
                }
            }
        });
    }

    fn begin_load(&self, program: ProgramId, pending: Option<PendingReconciliation>) {
        {
            let mut state = self.inner.state.lock();
            state.sync.current_program = Some(program.clone());
            state.sync.pending_reconciliation = pending;
            state.player = None;
        }
        self.inner.loader.load(&program);
    }

    fn publish(&self, command: PlaybackCommand) {
        let action = command.action();
        if let Err(e) = self.inner.sink.publish(command) {
            tracing::warn!("Failed to publish {} to room {}: {}", action, self.room_id(), e);
        }
    }
}

fn restore(player: &dyn PlaybackEngine, pending: PendingReconciliation) {
    player.seek(pending.time);
    if pending.is_playing {
        player.play();
    } else {
        player.pause();
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::player::SimulatedPlayer;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn drain(engine: &SyncEngine, rx: &mut mpsc::UnboundedReceiver<LocalEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            engine.on_local_event(event);
            count += 1;
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn remote_commands_are_never_echoed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let player = Arc::new(SimulatedPlayer::new("tt-42".into(), None, tx));
        let (engine, sink, _) = watching("tt-42", player);

        let commands = [
            PlaybackCommand::Play { time: 30.0 },
            PlaybackCommand::Seek { time: 45.0 },
            PlaybackCommand::Pause { time: 46.0 },
            PlaybackCommand::SyncState {
                program_id: "tt-42".into(),
                time: 10.0,
                is_playing: true,
            },
            PlaybackCommand::Seek { time: 12.0 },
        ];
        let mut observed = 0;
        for command in commands {
            engine.handle_remote(command);
            tokio::time::advance(Duration::from_millis(50)).await;
            observed += drain(&engine, &mut rx);
        }

        // every command above moves the simulated player at least once
        assert!(observed >= 5);
        assert!(sink.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn local_actions_publish_once_grace_expires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let player = Arc::new(SimulatedPlayer::new("tt-42".into(), None, tx));
        let (engine, sink, _) = watching("tt-42", player.clone());

        engine.handle_remote(PlaybackCommand::Seek { time: 20.0 });
        drain(&engine, &mut rx);
        assert!(engine.state().suppressed);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!engine.state().suppressed);

        player.seek(25.0);
        player.play();
        drain(&engine, &mut rx);
        assert_eq!(
            sink.take(),
            vec![
                PlaybackCommand::Seek { time: 25.0 },
                PlaybackCommand::Play { time: 25.0 }
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn newer_remote_command_extends_suppression() {
        let player = ScriptedPlayer::at("tt-42", 0.0);
        let (engine, _, _) = watching("tt-42", player);

        engine.handle_remote(PlaybackCommand::Seek { time: 1.0 });
        tokio::time::sleep(Duration::from_millis(400)).await;
        engine.handle_remote(PlaybackCommand::Seek { time: 2.0 });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(engine.state().suppressed, "first timer must not lift the second window");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!engine.state().suppressed);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_seek_lands_on_same_time() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let player = Arc::new(SimulatedPlayer::new("tt-42".into(), None, tx));
        let (engine, _, _) = watching("tt-42", player.clone());

        engine.handle_remote(PlaybackCommand::Seek { time: 73.5 });
        let once = player.current_time();
        engine.handle_remote(PlaybackCommand::Seek { time: 73.5 });
        assert!((player.current_time() - once).abs() < 1e-9);
        assert!((once - 73.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn play_within_tolerance_does_not_seek() {
        let player = ScriptedPlayer::at("tt-42", 10.0);
        let (engine, _, _) = watching("tt-42", player.clone());

        engine.handle_remote(PlaybackCommand::Play { time: 12.0 });
        assert_eq!(player.calls(), vec![Call::Play]);
    }

    #[tokio::test(start_paused = true)]
    async fn play_beyond_tolerance_seeks_first() {
        let player = ScriptedPlayer::at("tt-42", 10.0);
        let (engine, _, _) = watching("tt-42", player.clone());

        engine.handle_remote(PlaybackCommand::Play { time: 12.5 });
        assert_eq!(player.calls(), vec![Call::Seek(12.5), Call::Play]);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_aligns_exactly() {
        let player = ScriptedPlayer::at("tt-42", 10.0);
        let (engine, _, _) = watching("tt-42", player.clone());

        engine.handle_remote(PlaybackCommand::Pause { time: 10.4 });
        assert_eq!(player.calls(), vec![Call::Seek(10.4), Call::Pause]);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_without_player_are_dropped() {
        let (engine, sink, _) = engine();
        engine.handle_remote(PlaybackCommand::Play { time: 5.0 });
        engine.handle_remote(PlaybackCommand::Seek { time: 5.0 });
        assert_eq!(engine.state(), LocalSyncState::default());
        assert!(sink.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sync_state_for_other_program_waits_for_readiness() {
        let old = ScriptedPlayer::at("A", 5.0);
        let (engine, _, loader) = watching("A", old.clone());

        engine.handle_remote(PlaybackCommand::SyncState {
            program_id: "B".into(),
            time: 50.0,
            is_playing: false,
        });

        assert!(old.calls().is_empty(), "program A's player must not be touched");
        assert_eq!(*loader.requested.lock(), vec![ProgramId::new("B")]);
        let state = engine.state();
        assert_eq!(state.current_program, Some(ProgramId::new("B")));
        assert_eq!(
            state.pending_reconciliation,
            Some(PendingReconciliation {
                time: 50.0,
                is_playing: false
            })
        );

        let fresh = ScriptedPlayer::at("B", 0.0);
        engine.on_player_ready(fresh.clone());
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(fresh.calls().is_empty(), "must wait for the settle delay");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fresh.calls(), vec![Call::Seek(50.0), Call::Pause]);
        assert!(engine.state().pending_reconciliation.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sync_state_for_current_program_applies_immediately() {
        let player = ScriptedPlayer::at("A", 5.0);
        let (engine, _, loader) = watching("A", player.clone());

        engine.handle_remote(PlaybackCommand::SyncState {
            program_id: "A".into(),
            time: 80.0,
            is_playing: true,
        });
        assert_eq!(player.calls(), vec![Call::Seek(80.0), Call::Play]);
        assert!(loader.requested.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_sync_state_supersedes_pending() {
        let (engine, _, _) = engine();
        engine.handle_remote(PlaybackCommand::SyncState {
            program_id: "B".into(),
            time: 10.0,
            is_playing: false,
        });
        engine.handle_remote(PlaybackCommand::SyncState {
            program_id: "B".into(),
            time: 20.0,
            is_playing: true,
        });

        let player = ScriptedPlayer::at("B", 0.0);
        engine.on_player_ready(player.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(player.calls(), vec![Call::Seek(20.0), Call::Play]);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_state_during_settle_replaces_pending() {
        let (engine, _, _) = engine();
        engine.handle_remote(PlaybackCommand::SyncState {
            program_id: "B".into(),
            time: 10.0,
            is_playing: false,
        });
        let player = ScriptedPlayer::at("B", 0.0);
        engine.on_player_ready(player.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.handle_remote(PlaybackCommand::SyncState {
            program_id: "B".into(),
            time: 200.0,
            is_playing: true,
        });
        assert!(engine.state().pending_reconciliation.is_none());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(player.calls(), vec![Call::Seek(200.0), Call::Play]);
        assert_eq!(player.current_time(), 200.0);
        assert!(player.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn seek_during_settle_is_not_rewound() {
        let (engine, _, _) = engine();
        engine.handle_remote(PlaybackCommand::SyncState {
            program_id: "B".into(),
            time: 10.0,
            is_playing: false,
        });
        let player = ScriptedPlayer::at("B", 0.0);
        engine.on_player_ready(player.clone());

        tokio::time::sleep(Duration::from_millis(400)).await;
        engine.handle_remote(PlaybackCommand::Seek { time: 300.0 });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(player.calls(), vec![Call::Seek(300.0)]);
        assert_eq!(player.current_time(), 300.0);
    }

    #[tokio::test(start_paused = true)]
    async fn redundant_change_program_does_not_reload() {
        let player = ScriptedPlayer::at("P", 0.0);
        let (engine, _, loader) = watching("P", player.clone());

        engine.handle_remote(PlaybackCommand::ChangeProgram {
            program_id: "P".into(),
        });
        assert!(loader.requested.lock().is_empty());
        assert!(engine.player().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn change_program_loads_without_position() {
        let player = ScriptedPlayer::at("P", 30.0);
        let (engine, _, loader) = watching("P", player.clone());

        engine.handle_remote(PlaybackCommand::ChangeProgram {
            program_id: "Q".into(),
        });
        assert_eq!(*loader.requested.lock(), vec![ProgramId::new("Q")]);
        assert!(engine.player().is_none());

        let next = ScriptedPlayer::at("Q", 0.0);
        engine.on_player_ready(next.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(next.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ready_player_for_abandoned_program_is_ignored() {
        let (engine, _, _) = engine();
        engine.select_program("A".into());
        engine.select_program("B".into());

        engine.on_player_ready(ScriptedPlayer::at("A", 0.0));
        assert!(engine.player().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn select_program_announces_even_while_suppressed() {
        let player = ScriptedPlayer::at("A", 0.0);
        let (engine, sink, loader) = watching("A", player);
        engine.handle_remote(PlaybackCommand::Seek { time: 3.0 });
        assert!(engine.state().suppressed);

        engine.select_program("B".into());
        assert_eq!(
            sink.take(),
            vec![PlaybackCommand::ChangeProgram {
                program_id: "B".into()
            }]
        );
        assert_eq!(*loader.requested.lock(), vec![ProgramId::new("B")]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_sink_is_absorbed() {
        struct BrokenSink;
        impl CommandSink for BrokenSink {
            fn publish(&self, _: PlaybackCommand) -> anyhow::Result<()> {
                anyhow::bail!("relay gone")
            }
        }

        let engine = SyncEngine::new(
            "r1",
            SyncTimings::default(),
            Arc::new(BrokenSink),
            Arc::new(RecordingLoader::default()),
        );
        engine.select_program("A".into());
        engine.on_local_event(LocalEvent::Play { time: 0.0 });
        assert_eq!(engine.current_program(), Some(ProgramId::new("A")));
    }
}
