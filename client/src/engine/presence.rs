//! Presence: sharing what we are watching with peers that need it.

use crate::protocol::PlaybackCommand;

use super::SyncEngine;

impl SyncEngine {
    /// Our current program and position, if a program is loaded and playable
    pub fn snapshot(&self) -> Option<PlaybackCommand> {
        let (program, player) = {
            let state = self.inner.state.lock();
            (state.sync.current_program.clone()?, state.player.clone()?)
        };
        if player.program() != &program {
            return None;
        }
        Some(PlaybackCommand::SyncState {
            program_id: program,
            time: player.current_time(),
            is_playing: player.is_playing(),
        })
    }

    /// A peer joined the room; offer our state without waiting to be asked
    pub fn on_peer_joined(&self) {
        match self.snapshot() {
            Some(state) => {
                tracing::info!("Peer joined room {}; sharing our state", self.room_id());
                self.publish(state);
            }
            None => tracing::debug!("Peer joined room {}; nothing to share yet", self.room_id()),
        }
    }

    /// After joining, ask the room what it is watching once the join has settled
    pub fn begin_bootstrap(&self) {
        let weak = std::sync::Arc::downgrade(&self.inner);
        let delay = self.inner.timings.bootstrap_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let engine = SyncEngine { inner };
                tracing::info!("Requesting room state for {}", engine.room_id());
                engine.publish(PlaybackCommand::RequestSync);
            }
        });
    }

    pub(super) fn answer_sync_request(&self) {
        match self.snapshot() {
            Some(state) => self.publish(state),
            None => tracing::debug!("Sync requested but no program is playing here"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::protocol::{PlaybackCommand, ProgramId};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn answers_request_sync_with_current_state() {
        let player = ScriptedPlayer::at("tt-42", 100.0);
        *player.playing.lock() = true;
        let (engine, sink, _) = watching("tt-42", player);

        engine.handle_remote(PlaybackCommand::RequestSync);
        assert_eq!(
            sink.take(),
            vec![PlaybackCommand::SyncState {
                program_id: ProgramId::new("tt-42"),
                time: 100.0,
                is_playing: true,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stays_silent_without_program() {
        let (engine, sink, _) = engine();
        engine.handle_remote(PlaybackCommand::RequestSync);
        engine.on_peer_joined();
        assert!(sink.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stays_silent_while_program_loads() {
        let (engine, sink, _) = engine();
        engine.select_program("tt-42".into());
        sink.take();

        engine.handle_remote(PlaybackCommand::RequestSync);
        assert!(sink.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn peer_join_triggers_proactive_state() {
        let player = ScriptedPlayer::at("tt-42", 7.0);
        let (engine, sink, _) = watching("tt-42", player);

        engine.on_peer_joined();
        assert_eq!(
            sink.take(),
            vec![PlaybackCommand::SyncState {
                program_id: ProgramId::new("tt-42"),
                time: 7.0,
                is_playing: false,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_requests_sync_after_delay() {
        let (engine, sink, _) = engine();
        engine.begin_bootstrap();

        tokio::time::sleep(Duration::from_millis(1400)).await;
        assert!(sink.take().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.take(), vec![PlaybackCommand::RequestSync]);
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_is_dropped_with_engine() {
        let (engine, sink, _) = engine();
        engine.begin_bootstrap();
        drop(engine);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(sink.take().is_empty());
    }
}
