use crate::chat;
use crate::directory::Directory;
use crate::playback::{Action, EngineEvent, EngineState, PlaybackEngine};
use crate::player::{Player, PlayerEvent};
use crate::room::{self, lift, MemberHandle, RoomError};
use crate::store::{StoreConn, StoreError, StoreEvent};
use crate::types::{room_path, Role, RoomDoc, RoomId, TransportWrite};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

enum Input {
    Store(Option<StoreEvent>),
    Player(Option<PlayerEvent>),
}

/// One participant's live session: owns the store connection, the room
/// subscription and the reconciliation engine, and drives a player from them.
pub struct Session {
    conn: StoreConn,
    display_name: String,
    member: MemberHandle,
    engine: PlaybackEngine,
    chat_seen: usize,
    members_seen: usize,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a fresh room and joins it as its admin.
    pub async fn create_room(conn: StoreConn, directory: &dyn Directory) -> Result<Self, RoomError> {
        let room_id = room::create_room(&conn).await?;
        Self::join(conn, directory, room_id).await
    }

    /// Joins an existing room; the role comes from the room document.
    pub async fn join_room(
        conn: StoreConn,
        directory: &dyn Directory,
        room_id: RoomId,
    ) -> Result<Self, RoomError> {
        Self::join(conn, directory, room_id).await
    }

    async fn join(
        conn: StoreConn,
        directory: &dyn Directory,
        room_id: RoomId,
    ) -> Result<Self, RoomError> {
        let profile = directory.lookup_profile(conn.identity());
        let member = room::join_room(&conn, &room_id, &profile.display_name).await?;
        let engine = PlaybackEngine::new(member.role());
        Ok(Self {
            conn,
            display_name: profile.display_name,
            member,
            engine,
            chat_seen: 0,
            members_seen: 0,
        })
    }

    pub fn room_id(&self) -> &RoomId {
        self.member.room_id()
    }

    pub fn role(&self) -> Role {
        self.member.role()
    }

    /// Detachable control surface for this session, usable while the running
    /// loop owns the `Session` itself.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            conn: self.conn.clone(),
            room_id: self.member.room_id().clone(),
            role: self.member.role(),
            display_name: self.display_name.clone(),
        }
    }

    /// Drives the session until the room ends, the connection closes, or the
    /// player goes away. Closes the store connection on the way out.
    pub async fn run(mut self, mut player: Box<dyn Player>, mut events: mpsc::Receiver<PlayerEvent>) {
        info!(
            "Session loop for {} in room {} ({:?}) started",
            self.conn.identity(),
            self.member.room_id(),
            self.member.role()
        );
        loop {
            let input = tokio::select! {
                snapshot = self.member.subscription().next() => Input::Store(snapshot),
                event = events.recv() => Input::Player(event),
            };
            match input {
                Input::Store(Some(event)) => self.on_snapshot(event, player.as_mut()).await,
                Input::Store(None) => {
                    // Connection closed under us; treat it like a vanished room.
                    let actions = self.engine.handle(EngineEvent::Room(None));
                    self.execute(actions, player.as_mut()).await;
                }
                Input::Player(Some(event)) => {
                    let actions = self.engine.handle(EngineEvent::Player(event));
                    self.execute(actions, player.as_mut()).await;
                }
                Input::Player(None) => break,
            }
            if self.engine.state() == EngineState::Terminated {
                break;
            }
        }
        info!(
            "Session loop for {} in room {} finished",
            self.conn.identity(),
            self.member.room_id()
        );
        self.conn.close().await;
    }

    async fn on_snapshot(&mut self, event: StoreEvent, player: &mut dyn Player) {
        let doc = match event.data {
            Some(data) => match serde_json::from_value::<RoomDoc>(data) {
                Ok(doc) => Some(doc),
                Err(err) => {
                    error!(
                        "Undecodable room document for {}: {}",
                        self.member.room_id(),
                        err
                    );
                    return;
                }
            },
            None => None,
        };
        if let Some(doc) = &doc {
            self.note_chat(doc);
            self.note_members(doc);
        }
        let actions = self.engine.handle(EngineEvent::Room(doc));
        self.execute(actions, player).await;
    }

    fn note_chat(&mut self, doc: &RoomDoc) {
        if doc.chat.len() <= self.chat_seen {
            return;
        }
        for entry in doc.chat.values().skip(self.chat_seen) {
            info!(
                "[{}] {}: {}",
                self.member.room_id(),
                entry.sender_name,
                entry.text
            );
        }
        self.chat_seen = doc.chat.len();
    }

    fn note_members(&mut self, doc: &RoomDoc) {
        if doc.members.len() != self.members_seen {
            debug!(
                "Room {} now has {} member(s)",
                self.member.room_id(),
                doc.members.len()
            );
            self.members_seen = doc.members.len();
        }
    }

    async fn execute(&mut self, actions: Vec<Action>, player: &mut dyn Player) {
        for action in actions {
            match action {
                Action::Load {
                    video_ref,
                    position,
                } => player.load(&video_ref, position),
                Action::Play => player.play(),
                Action::Pause => player.pause(),
                Action::Seek { position } => player.seek(position),
                Action::Release => player.release(),
                Action::Publish(write) => self.publish(&write).await,
            }
        }
    }

    async fn publish(&self, write: &TransportWrite) {
        let value = match serde_json::to_value(write) {
            Ok(value) => value,
            Err(err) => {
                error!("Unencodable transport write: {}", err);
                return;
            }
        };
        if let Err(err) = self
            .conn
            .merge(&room_path(self.member.room_id()), value)
            .await
        {
            // Lost the room mid-write; the snapshot stream delivers the shutdown.
            warn!(
                "Transport publish to {} failed: {}",
                self.member.room_id(),
                err
            );
        }
    }
}

/// Clonable control surface: chat, video selection, and teardown.
#[derive(Clone)]
pub struct SessionHandle {
    conn: StoreConn,
    room_id: RoomId,
    role: Role,
    display_name: String,
}

impl SessionHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub async fn send_chat(&self, text: &str) -> Result<(), RoomError> {
        chat::send_message(&self.conn, &self.room_id, &self.display_name, text).await?;
        Ok(())
    }

    /// Selects the room's video. The store rejects the write unless the
    /// caller administers the room, so no client-side gate is needed.
    pub async fn load_video(&self, video_ref: &str) -> Result<(), RoomError> {
        let write = TransportWrite::for_video(video_ref);
        let value = serde_json::to_value(&write).map_err(StoreError::from)?;
        self.conn
            .merge(&room_path(&self.room_id), value)
            .await
            .map_err(|err| lift(err, &self.room_id))
    }

    pub async fn end_room(&self) -> Result<(), RoomError> {
        room::end_room(&self.conn, &self.room_id).await
    }

    /// Leaves the room and closes the session's store connection; the running
    /// loop observes the closure and winds down.
    pub async fn leave(&self) -> Result<(), RoomError> {
        room::leave_room(&self.conn, &self.room_id, self.role).await
    }
}
