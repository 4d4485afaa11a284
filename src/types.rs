use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const ROOM_ID_LEN: usize = 5;
pub const ROOM_ID_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Returns the current time in milliseconds since UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default() // Duration::ZERO if the clock reads before the epoch
        .as_millis() as u64
}

/// A user-facing room identifier: five uppercase alphanumeric characters.
/// Typed manually when joining, so parsing folds case before validating.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn parse(value: &str) -> Result<Self, RoomIdError> {
        let value = value.trim().to_uppercase();
        if value.len() != ROOM_ID_LEN {
            return Err(RoomIdError::InvalidLength(value.len()));
        }
        for ch in value.chars() {
            if !ROOM_ID_ALPHABET.contains(ch) {
                return Err(RoomIdError::InvalidCharacter(ch));
            }
        }
        Ok(Self(value))
    }

    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        let alphabet = ROOM_ID_ALPHABET.as_bytes();
        let id = (0..ROOM_ID_LEN)
            .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomIdError {
    #[error("room id must be {ROOM_ID_LEN} characters, got {0}")]
    InvalidLength(usize),

    #[error("room id contains invalid character {0:?}")]
    InvalidCharacter(char),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Viewer,
}

/// Full room document as stored at `rooms/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDoc {
    pub admin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_ref: Option<String>,
    pub playback_position_seconds: f64,
    pub is_playing: bool,
    pub active: bool,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub members: BTreeMap<String, MemberEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chat: BTreeMap<String, ChatEntry>,
}

impl RoomDoc {
    pub fn new(admin_id: &str, created_at: u64) -> Self {
        Self {
            admin_id: admin_id.to_string(),
            video_ref: None,
            playback_position_seconds: 0.0,
            is_playing: false,
            active: true,
            created_at,
            members: BTreeMap::new(),
            chat: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberEntry {
    pub display_name: String,
    pub joined_at: u64,
    pub presence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: u64,
}

/// The admin's atomic transport update: position and play flag always travel
/// together, with the video reference included when a new one is selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportWrite {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_ref: Option<String>,
    pub playback_position_seconds: f64,
    pub is_playing: bool,
}

impl TransportWrite {
    pub fn playing(position: f64) -> Self {
        Self {
            video_ref: None,
            playback_position_seconds: position,
            is_playing: true,
        }
    }

    pub fn paused(position: f64) -> Self {
        Self {
            video_ref: None,
            playback_position_seconds: position,
            is_playing: false,
        }
    }

    /// A newly selected video starts paused at the beginning.
    pub fn for_video(video_ref: &str) -> Self {
        Self {
            video_ref: Some(video_ref.to_string()),
            playback_position_seconds: 0.0,
            is_playing: false,
        }
    }
}

pub fn room_path(room_id: &RoomId) -> String {
    format!("rooms/{}", room_id)
}

pub fn member_path(room_id: &RoomId, identity: &str) -> String {
    format!("rooms/{}/members/{}", room_id, identity)
}

pub fn chat_path(room_id: &RoomId) -> String {
    format!("rooms/{}/chat", room_id)
}
