use log::warn;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

const EVENT_CHANNEL_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Playing,
    Paused,
    Ended,
}

/// Notification from the embedded player back to its session.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Ready,
    StateChanged { state: PlayState, position: f64 },
    Seeked { position: f64 },
}

/// Transport surface of an embedded video player.
pub trait Player: Send {
    fn load(&mut self, video_ref: &str, position: f64);
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, position: f64);
    fn release(&mut self);
    fn position(&self) -> f64;
    fn state(&self) -> PlayState;
}

/// Command recorded by [`SimPlayer`], for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    Load { video_ref: String, position: f64 },
    Play,
    Pause,
    Seek { position: f64 },
    Release,
}

/// Deterministic in-process player. Commands mutate its transport state and
/// emit the same events a real embedded player would fire, whether the caller
/// is the session loop or a simulated person pressing its controls.
#[derive(Clone)]
pub struct SimPlayer {
    inner: Arc<Mutex<SimInner>>,
    events: mpsc::Sender<PlayerEvent>,
}

struct SimInner {
    loaded: Option<String>,
    position: f64,
    playing: bool,
    ended: bool,
    commands: Vec<PlayerCommand>,
}

impl SimPlayer {
    pub fn new() -> (Self, mpsc::Receiver<PlayerEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let player = Self {
            inner: Arc::new(Mutex::new(SimInner {
                loaded: None,
                position: 0.0,
                playing: false,
                ended: false,
                commands: Vec::new(),
            })),
            events,
        };
        (player, rx)
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: PlayerEvent) {
        if let Err(err) = self.events.try_send(event) {
            warn!("Dropping player event (buffer full or closed): {}", err);
        }
    }

    /// Signals that the embedded player finished initializing.
    pub fn mark_ready(&self) {
        self.emit(PlayerEvent::Ready);
    }

    /// Moves the playhead as if `seconds` of wall clock passed.
    pub fn advance(&self, seconds: f64) {
        let mut inner = self.lock();
        if inner.playing {
            inner.position += seconds;
        }
    }

    /// Runs the media to its end, as a real player does on the last frame.
    pub fn finish(&self) {
        let position = {
            let mut inner = self.lock();
            if inner.loaded.is_none() || !inner.playing {
                return;
            }
            inner.playing = false;
            inner.ended = true;
            inner.position
        };
        self.emit(PlayerEvent::StateChanged {
            state: PlayState::Ended,
            position,
        });
    }

    pub fn loaded(&self) -> Option<String> {
        self.lock().loaded.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.lock().playing
    }

    pub fn commands(&self) -> Vec<PlayerCommand> {
        self.lock().commands.clone()
    }
}

impl Player for SimPlayer {
    fn load(&mut self, video_ref: &str, position: f64) {
        let mut inner = self.lock();
        inner.loaded = Some(video_ref.to_string());
        inner.position = position;
        inner.playing = false;
        inner.ended = false;
        inner.commands.push(PlayerCommand::Load {
            video_ref: video_ref.to_string(),
            position,
        });
        // Loading emits nothing; the follow-up play or pause does.
    }

    fn play(&mut self) {
        let position = {
            let mut inner = self.lock();
            if inner.loaded.is_none() {
                return; // no media, nothing to do
            }
            inner.commands.push(PlayerCommand::Play);
            if inner.playing {
                return;
            }
            inner.playing = true;
            inner.ended = false;
            inner.position
        };
        self.emit(PlayerEvent::StateChanged {
            state: PlayState::Playing,
            position,
        });
    }

    fn pause(&mut self) {
        let position = {
            let mut inner = self.lock();
            if inner.loaded.is_none() {
                return;
            }
            inner.commands.push(PlayerCommand::Pause);
            if !inner.playing {
                return;
            }
            inner.playing = false;
            inner.position
        };
        self.emit(PlayerEvent::StateChanged {
            state: PlayState::Paused,
            position,
        });
    }

    fn seek(&mut self, position: f64) {
        {
            let mut inner = self.lock();
            if inner.loaded.is_none() {
                return;
            }
            inner.commands.push(PlayerCommand::Seek { position });
            inner.position = position;
            inner.ended = false;
        }
        self.emit(PlayerEvent::Seeked { position });
    }

    fn release(&mut self) {
        let mut inner = self.lock();
        inner.loaded = None;
        inner.position = 0.0;
        inner.playing = false;
        inner.ended = false;
        inner.commands.push(PlayerCommand::Release);
    }

    fn position(&self) -> f64 {
        self.lock().position
    }

    fn state(&self) -> PlayState {
        let inner = self.lock();
        if inner.ended {
            PlayState::Ended
        } else if inner.playing {
            PlayState::Playing
        } else {
            PlayState::Paused
        }
    }
}
