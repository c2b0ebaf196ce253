use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::protocol::ProgramId;

/// Playback changes observed on the local player, stamped with the position
/// at the moment they happened
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalEvent {
    Play { time: f64 },
    Pause { time: f64 },
    Seek { time: f64 },
}

/// A media element owned by the sync engine.
///
/// Calls are synchronous. Implementations report every play, pause and seek
/// (whoever caused it) as a [`LocalEvent`] through a channel, never by calling
/// back into the engine.
pub trait PlaybackEngine: Send + Sync {
    fn program(&self) -> &ProgramId;
    fn current_time(&self) -> f64;
    fn is_playing(&self) -> bool;
    fn play(&self);
    fn pause(&self);
    fn seek(&self, time: f64);
}

/// Starts loading a program. Completion is reported back to the engine with
/// the new player instance.
pub trait ProgramLoader: Send + Sync {
    fn load(&self, program: &ProgramId);
}

/// In-memory media clock standing in for a real video element
pub struct SimulatedPlayer {
    program: ProgramId,
    duration: Option<f64>,
    clock: Mutex<PlayerClock>,
    events: mpsc::UnboundedSender<LocalEvent>,
}

#[derive(Debug, Clone, Copy)]
struct PlayerClock {
    /// Position at `started_at`, or the frozen position while paused
    position: f64,
    started_at: Option<Instant>,
}

impl PlayerClock {
    fn now(&self, duration: Option<f64>) -> f64 {
        let raw = match self.started_at {
            Some(start) => self.position + start.elapsed().as_secs_f64(),
            None => self.position,
        };
        clamp_position(raw, duration)
    }
}

fn clamp_position(time: f64, duration: Option<f64>) -> f64 {
    let time = if time.is_finite() { time.max(0.0) } else { 0.0 };
    match duration {
        Some(limit) => time.min(limit),
        None => time,
    }
}

impl SimulatedPlayer {
    pub fn new(
        program: ProgramId,
        duration: Option<f64>,
        events: mpsc::UnboundedSender<LocalEvent>,
    ) -> Self {
        Self {
            program,
            duration,
            clock: Mutex::new(PlayerClock {
                position: 0.0,
                started_at: None,
            }),
            events,
        }
    }

    fn emit(&self, event: LocalEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Local event listener gone; dropping {:?}", event);
        }
    }
}

impl PlaybackEngine for SimulatedPlayer {
    fn program(&self) -> &ProgramId {
        &self.program
    }

    fn current_time(&self) -> f64 {
        self.clock.lock().now(self.duration)
    }

    fn is_playing(&self) -> bool {
        self.clock.lock().started_at.is_some()
    }

    fn play(&self) {
        let time = {
            let mut clock = self.clock.lock();
            if clock.started_at.is_some() {
                return;
            }
            clock.started_at = Some(Instant::now());
            clock.position
        };
        self.emit(LocalEvent::Play { time });
    }

    fn pause(&self) {
        let time = {
            let mut clock = self.clock.lock();
            if clock.started_at.is_none() {
                return;
            }
            clock.position = clock.now(self.duration);
            clock.started_at = None;
            clock.position
        };
        self.emit(LocalEvent::Pause { time });
    }

    fn seek(&self, time: f64) {
        let time = clamp_position(time, self.duration);
        {
            let mut clock = self.clock.lock();
            clock.position = time;
            if clock.started_at.is_some() {
                clock.started_at = Some(Instant::now());
            }
        }
        self.emit(LocalEvent::Seek { time });
    }
}
