//! Two-role playback reconciliation. One pure reducer consumes local player
//! reports and room snapshots and emits the player commands and transport
//! writes that keep every participant on the same frame.

use crate::player::{PlayState, PlayerEvent};
use crate::types::{Role, RoomDoc, TransportWrite};
use log::{debug, warn};

pub const MAX_POSITION_SECONDS: f64 = 86400.0; // 24 hours max

/// Accepts only positions a real player could report.
pub fn is_valid_position(pos: f64) -> bool {
    pos.is_finite() && (0.0..=MAX_POSITION_SECONDS).contains(&pos)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Idle,
    LoadedPaused,
    LoadedPlaying,
    Terminated,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Local player lifecycle and transport report.
    Player(PlayerEvent),
    /// Room snapshot from the store; `None` once the document is gone.
    Room(Option<RoomDoc>),
}

/// Command for the caller to run against its player or the room store.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Load { video_ref: String, position: f64 },
    Play,
    Pause,
    Seek { position: f64 },
    Release,
    Publish(TransportWrite),
}

pub struct PlaybackEngine {
    role: Role,
    state: EngineState,
    local: PlayState,
    loaded: Option<String>,
    /// Latest snapshot seen before the player reported ready.
    pending: Option<RoomDoc>,
}

impl PlaybackEngine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: EngineState::Uninitialized,
            local: PlayState::Paused,
            loaded: None,
            pending: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Feeds one event through the reducer and returns the actions to run.
    pub fn handle(&mut self, event: EngineEvent) -> Vec<Action> {
        if self.state == EngineState::Terminated {
            return Vec::new(); // nothing revives a finished session
        }
        match event {
            EngineEvent::Player(PlayerEvent::Ready) => self.on_ready(),
            EngineEvent::Player(PlayerEvent::StateChanged { state, position }) => {
                self.on_state_changed(state, position)
            }
            EngineEvent::Player(PlayerEvent::Seeked { position }) => self.on_seeked(position),
            EngineEvent::Room(doc) => self.on_room(doc),
        }
    }

    fn on_ready(&mut self) -> Vec<Action> {
        if self.state != EngineState::Uninitialized {
            debug!("Ignoring duplicate ready signal");
            return Vec::new();
        }
        self.state = EngineState::Idle;
        match self.pending.take() {
            Some(doc) => self.apply_snapshot(doc),
            None => Vec::new(),
        }
    }

    fn on_state_changed(&mut self, state: PlayState, position: f64) -> Vec<Action> {
        if !self.is_loaded() {
            debug!("Ignoring player state before a video is loaded");
            return Vec::new();
        }
        if !is_valid_position(position) {
            warn!("Ignoring player report with invalid position {}", position);
            return Vec::new();
        }
        self.local = state;
        self.state = if state == PlayState::Playing {
            EngineState::LoadedPlaying
        } else {
            EngineState::LoadedPaused
        };
        if self.role != Role::Admin {
            return Vec::new();
        }
        let write = match state {
            PlayState::Playing => TransportWrite::playing(position),
            PlayState::Paused => TransportWrite::paused(position),
            // End of media parks the room at the start, paused.
            PlayState::Ended => TransportWrite::paused(0.0),
        };
        vec![Action::Publish(write)]
    }

    fn on_seeked(&mut self, position: f64) -> Vec<Action> {
        if self.role != Role::Admin || !self.is_loaded() {
            return Vec::new();
        }
        if !is_valid_position(position) {
            warn!("Ignoring seek to invalid position {}", position);
            return Vec::new();
        }
        // Position and play state travel together so a viewer never observes
        // one without the other.
        let write = if self.local == PlayState::Playing {
            TransportWrite::playing(position)
        } else {
            TransportWrite::paused(position)
        };
        vec![Action::Publish(write)]
    }

    fn on_room(&mut self, doc: Option<RoomDoc>) -> Vec<Action> {
        let doc = match doc {
            Some(doc) if doc.active => doc,
            // Deleted or deactivated: the watch party is over.
            _ => return self.terminate(),
        };
        if self.state == EngineState::Uninitialized {
            // Player not ready yet; keep only the newest snapshot for replay.
            self.pending = Some(doc);
            return Vec::new();
        }
        self.apply_snapshot(doc)
    }

    fn terminate(&mut self) -> Vec<Action> {
        let release = self.state != EngineState::Uninitialized;
        self.pending = None;
        self.state = EngineState::Terminated;
        if release {
            vec![Action::Release]
        } else {
            Vec::new()
        }
    }

    fn apply_snapshot(&mut self, doc: RoomDoc) -> Vec<Action> {
        if !is_valid_position(doc.playback_position_seconds) {
            warn!(
                "Ignoring room snapshot with invalid position {}",
                doc.playback_position_seconds
            );
            return Vec::new();
        }
        let video_ref = match doc.video_ref {
            Some(ref video_ref) if !video_ref.is_empty() => video_ref.clone(),
            _ => return Vec::new(), // nothing selected yet
        };
        if self.loaded.as_deref() != Some(video_ref.as_str()) {
            // A video change loads on both roles; the admin hears its own
            // selection this way too.
            self.loaded = Some(video_ref.clone());
            self.local = if doc.is_playing {
                PlayState::Playing
            } else {
                PlayState::Paused
            };
            self.state = if doc.is_playing {
                EngineState::LoadedPlaying
            } else {
                EngineState::LoadedPaused
            };
            return vec![
                Action::Load {
                    video_ref,
                    position: doc.playback_position_seconds,
                },
                if doc.is_playing {
                    Action::Play
                } else {
                    Action::Pause
                },
            ];
        }
        if self.role == Role::Admin {
            // Own transport echo; the local player is the source of truth.
            return Vec::new();
        }
        if !self.is_loaded() {
            return Vec::new();
        }
        // Reconcile only on a play-state flip. Reseeking on every position
        // heartbeat would stutter the viewer without improving sync.
        let playing_locally = self.local == PlayState::Playing;
        if doc.is_playing && !playing_locally {
            self.local = PlayState::Playing;
            self.state = EngineState::LoadedPlaying;
            vec![
                Action::Seek {
                    position: doc.playback_position_seconds,
                },
                Action::Play,
            ]
        } else if !doc.is_playing && playing_locally {
            self.local = PlayState::Paused;
            self.state = EngineState::LoadedPaused;
            vec![
                Action::Seek {
                    position: doc.playback_position_seconds,
                },
                Action::Pause,
            ]
        } else {
            Vec::new()
        }
    }

    fn is_loaded(&self) -> bool {
        matches!(
            self.state,
            EngineState::LoadedPaused | EngineState::LoadedPlaying
        )
    }
}
