//! Room lifecycle: creation with collision-checked ids, join with role
//! resolution, and the teardown paths (explicit end, leave, lost connection).

use crate::store::{CleanupAction, StoreConn, StoreError, Subscription};
use crate::types::{member_path, now_ms, room_path, MemberEntry, Role, RoomDoc, RoomId};
use log::{debug, info};
use serde_json::json;

const MAX_ID_ATTEMPTS: u32 = 8;

#[derive(thiserror::Error, Debug)]
pub enum RoomError {
    #[error("room {0} does not exist")]
    RoomNotFound(RoomId),

    #[error("room {0} has ended")]
    RoomInactive(RoomId),

    #[error("operation reserved for the room admin")]
    Unauthorized,

    #[error("could not find a free room id after {0} attempts")]
    IdCollision(u32),

    #[error("chat messages must not be empty")]
    EmptyMessage,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Maps store-level denials onto the room taxonomy.
pub(crate) fn lift(err: StoreError, room_id: &RoomId) -> RoomError {
    match err {
        StoreError::PermissionDenied(_) => RoomError::Unauthorized,
        StoreError::NotFound(_) => RoomError::RoomNotFound(room_id.clone()),
        other => RoomError::Store(other),
    }
}

/// Creates a fresh room administered by the connection's identity and returns
/// its shareable id.
pub async fn create_room(conn: &StoreConn) -> Result<RoomId, RoomError> {
    create_room_with(conn, RoomId::generate).await
}

async fn create_room_with<F>(conn: &StoreConn, mut generate: F) -> Result<RoomId, RoomError>
where
    F: FnMut() -> RoomId,
{
    for attempt in 1..=MAX_ID_ATTEMPTS {
        let room_id = generate();
        if try_create(conn, &room_id).await? {
            info!("Created room {} for {}", room_id, conn.identity());
            return Ok(room_id);
        }
        debug!("Room id {} taken (attempt {})", room_id, attempt);
    }
    Err(RoomError::IdCollision(MAX_ID_ATTEMPTS))
}

async fn try_create(conn: &StoreConn, room_id: &RoomId) -> Result<bool, StoreError> {
    if conn.read(&room_path(room_id)).await?.is_some() {
        return Ok(false);
    }
    let doc = RoomDoc::new(conn.identity(), now_ms());
    match conn
        .write(&room_path(room_id), serde_json::to_value(doc)?)
        .await
    {
        Ok(()) => Ok(true),
        // Somebody else claimed the id between the read and the write.
        Err(StoreError::PermissionDenied(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Live membership in a room: the resolved role plus the snapshot stream.
pub struct MemberHandle {
    room_id: RoomId,
    role: Role,
    subscription: Subscription,
}

impl std::fmt::Debug for MemberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberHandle")
            .field("room_id", &self.room_id)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl MemberHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn subscription(&mut self) -> &mut Subscription {
        &mut self.subscription
    }
}

/// Joins an existing room, resolving the caller's role from the document and
/// registering the disconnect cleanups for it.
pub async fn join_room(
    conn: &StoreConn,
    room_id: &RoomId,
    display_name: &str,
) -> Result<MemberHandle, RoomError> {
    // Subscribe before validating so no transition between the two is missed.
    let mut subscription = conn.subscribe(&room_path(room_id)).await?;
    let first = subscription
        .next()
        .await
        .ok_or(StoreError::ConnectionClosed)?;
    let doc: RoomDoc = match first.data {
        Some(data) => serde_json::from_value(data).map_err(StoreError::from)?,
        None => return Err(RoomError::RoomNotFound(room_id.clone())),
    };
    if !doc.active {
        return Err(RoomError::RoomInactive(room_id.clone()));
    }
    let role = if doc.admin_id == conn.identity() {
        Role::Admin
    } else {
        Role::Viewer
    };
    match role {
        Role::Admin => {
            // A vanished admin ends the party for everyone: flip the flag so
            // subscribers observe the shutdown, then drop the document.
            conn.on_disconnect(
                &room_path(room_id),
                CleanupAction::Merge(json!({ "active": false })),
            )
            .await?;
            conn.on_disconnect(&room_path(room_id), CleanupAction::Remove)
                .await?;
        }
        Role::Viewer => {
            conn.on_disconnect(
                &member_path(room_id, conn.identity()),
                CleanupAction::Remove,
            )
            .await?;
        }
    }
    let entry = MemberEntry {
        display_name: display_name.to_string(),
        joined_at: now_ms(),
        presence: true,
    };
    conn.write(
        &member_path(room_id, conn.identity()),
        serde_json::to_value(entry).map_err(StoreError::from)?,
    )
    .await
    .map_err(|err| lift(err, room_id))?;
    info!("{} joined room {} as {:?}", conn.identity(), room_id, role);
    Ok(MemberHandle {
        room_id: room_id.clone(),
        role,
        subscription,
    })
}

/// Ends the party: flips the room inactive so every subscriber observes the
/// shutdown, then removes the document. Admin only, enforced by the store.
pub async fn end_room(conn: &StoreConn, room_id: &RoomId) -> Result<(), RoomError> {
    conn.merge(&room_path(room_id), json!({ "active": false }))
        .await
        .map_err(|err| lift(err, room_id))?;
    conn.delete(&room_path(room_id))
        .await
        .map_err(|err| lift(err, room_id))?;
    info!("Room {} ended by {}", room_id, conn.identity());
    Ok(())
}

/// Leaves the room and closes the connection. An admin leaving ends the room
/// for everybody; a viewer just drops out of the member list.
pub async fn leave_room(conn: &StoreConn, room_id: &RoomId, role: Role) -> Result<(), RoomError> {
    match role {
        Role::Admin => end_room(conn, room_id).await?,
        Role::Viewer => {
            conn.delete(&member_path(room_id, conn.identity()))
                .await
                .map_err(|err| lift(err, room_id))?;
        }
    }
    conn.close().await;
    Ok(())
}
