//! Watch-party coordination: replicated room documents, two-role playback
//! reconciliation, and a chat log, over a subscribable in-process store.

pub mod chat;
pub mod directory;
pub mod playback;
pub mod player;
pub mod room;
pub mod session;
pub mod store;
pub mod types;

pub use directory::{Directory, Profile, StaticDirectory};
pub use playback::{Action, EngineEvent, EngineState, PlaybackEngine};
pub use player::{PlayState, Player, PlayerCommand, PlayerEvent, SimPlayer};
pub use room::{MemberHandle, RoomError};
pub use session::{Session, SessionHandle};
pub use store::{CleanupAction, MemoryStore, StoreConn, StoreError, StoreEvent, Subscription};
pub use types::{ChatEntry, MemberEntry, Role, RoomDoc, RoomId, RoomIdError, TransportWrite};
