use crate::room::{lift, RoomError};
use crate::store::{StoreConn, StoreError};
use crate::types::{chat_path, now_ms, ChatEntry, RoomId};

/// Appends one chat message to the room log and returns its assigned key.
/// The text is trimmed first; an all-whitespace message never reaches the
/// store.
pub async fn send_message(
    conn: &StoreConn,
    room_id: &RoomId,
    sender_name: &str,
    text: &str,
) -> Result<String, RoomError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(RoomError::EmptyMessage);
    }
    let entry = ChatEntry {
        sender_id: conn.identity().to_string(),
        sender_name: sender_name.to_string(),
        text: text.to_string(),
        timestamp: now_ms(),
    };
    let value = serde_json::to_value(entry).map_err(StoreError::from)?;
    conn.append(&chat_path(room_id), value)
        .await
        .map_err(|err| lift(err, room_id))
}
