//! In-process replicated room store.
//!
//! Documents live in one JSON tree addressed by `/`-separated paths.
//! Connections are identity-bound; every mutation is checked against write
//! rules store-side, so a client that skips its own gating still cannot
//! forge admin writes. Subscribers receive full-document snapshots with
//! latest-state semantics: a slow reader observes the newest state, never
//! a reordered one.

use crate::playback::is_valid_position;
use futures::StreamExt;
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("permission denied at {0}")]
    PermissionDenied(String),

    #[error("no document at {0}")]
    NotFound(String),

    #[error("value at {0} is not an object")]
    NotAnObject(String),

    #[error("invalid store path {0:?}")]
    InvalidPath(String),

    #[error("store connection closed")]
    ConnectionClosed,

    #[error("invalid document: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One full-document snapshot of a subscribed path. `data` is `None` when
/// nothing exists at the path (never written, or deleted).
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub seq: u64,
    pub data: Option<Value>,
}

/// Server-side action to run when the registering connection goes away.
#[derive(Debug, Clone)]
pub enum CleanupAction {
    Remove,
    Set(Value),
    Merge(Value),
}

enum WriteOp {
    Write(Value),
    Merge(Value),
    Delete,
    Append(Value),
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<StoreState>>,
}

struct StoreState {
    root: Value,
    seq: u64,
    append_seq: u64,
    watches: HashMap<String, watch::Sender<StoreEvent>>,
    cleanups: HashMap<Uuid, Vec<(String, CleanupAction)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreState {
                root: Value::Object(serde_json::Map::new()),
                seq: 0,
                append_seq: 0,
                watches: HashMap::new(),
                cleanups: HashMap::new(),
            })),
        }
    }

    /// Opens a connection bound to an authenticated identity. All writes made
    /// through the connection are checked against that identity.
    pub fn connect(&self, identity: &str) -> StoreConn {
        let conn_id = Uuid::new_v4();
        debug!("Store connection {} opened for {}", conn_id, identity);
        let (closed, _) = watch::channel(false);
        StoreConn {
            shared: Arc::new(ConnShared {
                store: self.clone(),
                identity: identity.to_string(),
                conn_id,
                closed,
            }),
        }
    }

    async fn mutate(
        &self,
        identity: &str,
        path: &str,
        op: WriteOp,
    ) -> Result<Option<String>, StoreError> {
        let segs = split_path(path)?;
        let mut state = self.inner.write().await;
        if let Err(err) = check_rules(&state.root, identity, &segs, &op) {
            if matches!(err, StoreError::PermissionDenied(_)) {
                warn!("Denied write at {} for {}", path, identity);
            }
            return Err(err);
        }
        let state = &mut *state;
        let key = apply(&mut state.root, &segs, op, &mut state.append_seq)?;
        state.notify(path);
        Ok(key)
    }

    async fn run_cleanups(&self, conn_id: Uuid, identity: &str) {
        let mut state = self.inner.write().await;
        let cleanups = match state.cleanups.remove(&conn_id) {
            Some(cleanups) => cleanups,
            None => return,
        };
        if !cleanups.is_empty() {
            debug!(
                "Running {} disconnect cleanups for {}",
                cleanups.len(),
                identity
            );
        }
        for (path, action) in cleanups {
            let op = match action {
                CleanupAction::Remove => WriteOp::Delete,
                CleanupAction::Set(value) => WriteOp::Write(value),
                CleanupAction::Merge(value) => WriteOp::Merge(value),
            };
            let segs = match split_path(&path) {
                Ok(segs) => segs,
                Err(_) => continue,
            };
            if let Err(err) = check_rules(&state.root, identity, &segs, &op) {
                debug!("Disconnect cleanup at {} skipped: {}", path, err);
                continue;
            }
            let state = &mut *state;
            if let Err(err) = apply(&mut state.root, &segs, op, &mut state.append_seq) {
                debug!("Disconnect cleanup at {} failed: {}", path, err);
                continue;
            }
            state.notify(&path);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreState {
    fn notify(&mut self, mutated: &str) {
        let StoreState {
            root, seq, watches, ..
        } = self;
        watches.retain(|watched, tx| {
            if tx.receiver_count() == 0 {
                return false; // nobody left listening on this path
            }
            if overlaps(watched, mutated) {
                let snapshot = lookup(root, watched).cloned();
                if tx.borrow().data != snapshot {
                    *seq += 1;
                    tx.send_replace(StoreEvent {
                        seq: *seq,
                        data: snapshot,
                    });
                }
            }
            true
        });
    }
}

struct ConnShared {
    store: MemoryStore,
    identity: String,
    conn_id: Uuid,
    closed: watch::Sender<bool>,
}

impl Drop for ConnShared {
    fn drop(&mut self) {
        if self.closed.send_replace(true) {
            return;
        }
        // Dropped without close(): treat it like a lost client and run the
        // registered cleanups from a background task.
        let store = self.store.clone();
        let conn_id = self.conn_id;
        let identity = std::mem::take(&mut self.identity);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                store.run_cleanups(conn_id, &identity).await;
            });
        }
    }
}

/// Identity-bound store connection. Clones share the same connection: closing
/// any clone closes all of them and fires the disconnect cleanups exactly once.
#[derive(Clone)]
pub struct StoreConn {
    shared: Arc<ConnShared>,
}

impl StoreConn {
    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if *self.shared.closed.borrow() {
            return Err(StoreError::ConnectionClosed);
        }
        Ok(())
    }

    pub async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.ensure_open()?;
        split_path(path)?;
        let state = self.shared.store.inner.read().await;
        Ok(lookup(&state.root, path).cloned())
    }

    /// Replaces the value at `path`, creating parents as needed.
    pub async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.shared
            .store
            .mutate(&self.shared.identity, path, WriteOp::Write(value))
            .await
            .map(|_| ())
    }

    /// Shallow-merges the fields of `value` into the object at `path`.
    pub async fn merge(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.shared
            .store
            .mutate(&self.shared.identity, path, WriteOp::Merge(value))
            .await
            .map(|_| ())
    }

    pub async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.shared
            .store
            .mutate(&self.shared.identity, path, WriteOp::Delete)
            .await
            .map(|_| ())
    }

    /// Appends `value` under a store-assigned key at `path` and returns the
    /// key. Keys sort lexicographically in assignment order.
    pub async fn append(&self, path: &str, value: Value) -> Result<String, StoreError> {
        self.ensure_open()?;
        let key = self
            .shared
            .store
            .mutate(&self.shared.identity, path, WriteOp::Append(value))
            .await?;
        // Append always assigns a key
        Ok(key.unwrap_or_default())
    }

    /// Subscribes to full-document snapshots of `path`. The current state is
    /// delivered immediately, then once per observed change; intermediate
    /// states a slow reader misses are superseded, not queued.
    pub async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        self.ensure_open()?;
        split_path(path)?;
        let mut state = self.shared.store.inner.write().await;
        let rx = match state.watches.get(path) {
            Some(tx) => tx.subscribe(),
            None => {
                let snapshot = lookup(&state.root, path).cloned();
                state.seq += 1;
                let (tx, rx) = watch::channel(StoreEvent {
                    seq: state.seq,
                    data: snapshot,
                });
                state.watches.insert(path.to_string(), tx);
                rx
            }
        };
        Ok(Subscription {
            stream: WatchStream::new(rx),
            closed: self.shared.closed.subscribe(),
        })
    }

    /// Registers a cleanup the store runs when this connection closes or is
    /// dropped. Cleanups run in registration order under this connection's
    /// identity; denied or stale ones are skipped.
    pub async fn on_disconnect(&self, path: &str, action: CleanupAction) -> Result<(), StoreError> {
        self.ensure_open()?;
        split_path(path)?;
        let mut state = self.shared.store.inner.write().await;
        state
            .cleanups
            .entry(self.shared.conn_id)
            .or_default()
            .push((path.to_string(), action));
        Ok(())
    }

    /// Closes the connection and fires its disconnect cleanups. Safe to call
    /// more than once; later calls are no-ops.
    pub async fn close(&self) {
        if self.shared.closed.send_replace(true) {
            return;
        }
        debug!(
            "Store connection {} closed for {}",
            self.shared.conn_id, self.shared.identity
        );
        self.shared
            .store
            .run_cleanups(self.shared.conn_id, &self.shared.identity)
            .await;
    }
}

/// Change stream for one subscribed path. Ends when the owning connection
/// closes.
pub struct Subscription {
    stream: WatchStream<StoreEvent>,
    closed: watch::Receiver<bool>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<StoreEvent> {
        tokio::select! {
            event = self.stream.next() => event,
            _ = self.closed.wait_for(|closed| *closed) => None,
        }
    }
}

fn split_path(path: &str) -> Result<Vec<&str>, StoreError> {
    let segs: Vec<&str> = path.split('/').collect();
    if path.is_empty() || segs.iter().any(|seg| seg.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segs)
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for seg in path.split('/') {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

fn is_prefix(prefix: &str, path: &str) -> bool {
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

fn overlaps(a: &str, b: &str) -> bool {
    is_prefix(a, b) || is_prefix(b, a)
}

fn ensure_object<'a>(
    root: &'a mut Value,
    segs: &[&str],
) -> Result<&'a mut serde_json::Map<String, Value>, StoreError> {
    let mut cur = root;
    for seg in segs {
        let obj = cur
            .as_object_mut()
            .ok_or_else(|| StoreError::NotAnObject(segs.join("/")))?;
        cur = obj
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    cur.as_object_mut()
        .ok_or_else(|| StoreError::NotAnObject(segs.join("/")))
}

fn remove_at(root: &mut Value, segs: &[&str]) {
    let (parents, leaf) = segs.split_at(segs.len() - 1);
    let mut cur = root;
    for seg in parents {
        match cur.get_mut(*seg) {
            Some(next) => cur = next,
            None => return,
        }
    }
    if let Some(obj) = cur.as_object_mut() {
        obj.remove(leaf[0]);
    }
}

fn apply(
    root: &mut Value,
    segs: &[&str],
    op: WriteOp,
    append_seq: &mut u64,
) -> Result<Option<String>, StoreError> {
    match op {
        WriteOp::Write(value) => {
            let (parents, leaf) = segs.split_at(segs.len() - 1);
            let obj = ensure_object(root, parents)?;
            obj.insert(leaf[0].to_string(), value);
            Ok(None)
        }
        WriteOp::Merge(value) => {
            let obj = ensure_object(root, segs)?;
            if let Value::Object(fields) = value {
                for (key, field) in fields {
                    obj.insert(key, field);
                }
            }
            Ok(None)
        }
        WriteOp::Delete => {
            remove_at(root, segs);
            Ok(None)
        }
        WriteOp::Append(value) => {
            let obj = ensure_object(root, segs)?;
            *append_seq += 1;
            // Zero-padded so lexicographic order equals assignment order.
            let key = format!("{:020}", append_seq);
            obj.insert(key.clone(), value);
            Ok(Some(key))
        }
    }
}

/// Write rules, mirrored after the hosted ruleset the documents were designed
/// for: room transport and lifecycle are admin-only, a member entry belongs
/// to its own participant, chat entries must carry the writer's identity and
/// are immutable once appended. Everything else is denied.
fn check_rules(
    root: &Value,
    identity: &str,
    segs: &[&str],
    op: &WriteOp,
) -> Result<(), StoreError> {
    match segs {
        ["rooms", room] => check_room_rules(root, identity, room, op),
        ["rooms", room, "members", member] => check_member_rules(root, identity, room, member, op),
        ["rooms", room, "chat"] => check_chat_rules(root, identity, room, op),
        _ => Err(StoreError::PermissionDenied(segs.join("/"))),
    }
}

fn room_admin<'a>(root: &'a Value, room: &str) -> Option<&'a str> {
    lookup(root, &format!("rooms/{}", room))
        .and_then(|doc| doc.get("adminId"))
        .and_then(Value::as_str)
}

fn check_room_rules(
    root: &Value,
    identity: &str,
    room: &str,
    op: &WriteOp,
) -> Result<(), StoreError> {
    let path = format!("rooms/{}", room);
    let existing_admin = room_admin(root, room);
    match op {
        WriteOp::Write(value) => {
            let new_admin = value.get("adminId").and_then(Value::as_str);
            match existing_admin {
                // Creation: a client may only create a room it administers.
                None if new_admin == Some(identity) => Ok(()),
                // Rewrites keep the admin fixed for the room's life.
                Some(admin) if admin == identity && new_admin == Some(admin) => Ok(()),
                _ => Err(StoreError::PermissionDenied(path)),
            }
        }
        WriteOp::Merge(value) => {
            let admin = match existing_admin {
                Some(admin) => admin,
                None => return Err(StoreError::NotFound(path)),
            };
            if admin != identity {
                return Err(StoreError::PermissionDenied(path));
            }
            let fields = match value.as_object() {
                Some(fields) => fields,
                None => return Err(StoreError::NotAnObject(path)),
            };
            for (key, field) in fields {
                let ok = match key.as_str() {
                    "videoRef" => field.is_string(),
                    "playbackPositionSeconds" => {
                        field.as_f64().map(is_valid_position).unwrap_or(false)
                    }
                    "isPlaying" | "active" => field.is_boolean(),
                    // adminId, createdAt, members and chat are not merge targets
                    _ => false,
                };
                if !ok {
                    return Err(StoreError::PermissionDenied(path));
                }
            }
            Ok(())
        }
        WriteOp::Delete => match existing_admin {
            None => Ok(()), // removing a missing room is a no-op
            Some(admin) if admin == identity => Ok(()),
            Some(_) => Err(StoreError::PermissionDenied(path)),
        },
        WriteOp::Append(_) => Err(StoreError::PermissionDenied(path)),
    }
}

fn check_member_rules(
    root: &Value,
    identity: &str,
    room: &str,
    member: &str,
    op: &WriteOp,
) -> Result<(), StoreError> {
    let path = format!("rooms/{}/members/{}", room, member);
    if member != identity {
        return Err(StoreError::PermissionDenied(path));
    }
    match op {
        // Deletes stay idempotent even when the room is already gone.
        WriteOp::Delete => Ok(()),
        WriteOp::Write(value) | WriteOp::Merge(value) => {
            if room_admin(root, room).is_none() {
                return Err(StoreError::NotFound(format!("rooms/{}", room)));
            }
            if !value.is_object() {
                return Err(StoreError::NotAnObject(path));
            }
            Ok(())
        }
        WriteOp::Append(_) => Err(StoreError::PermissionDenied(path)),
    }
}

fn check_chat_rules(
    root: &Value,
    identity: &str,
    room: &str,
    op: &WriteOp,
) -> Result<(), StoreError> {
    let path = format!("rooms/{}/chat", room);
    match op {
        WriteOp::Append(value) => {
            if room_admin(root, room).is_none() {
                return Err(StoreError::NotFound(format!("rooms/{}", room)));
            }
            let sender = value.get("senderId").and_then(Value::as_str);
            if sender != Some(identity) {
                return Err(StoreError::PermissionDenied(path));
            }
            Ok(())
        }
        // The log is append-only
        _ => Err(StoreError::PermissionDenied(path)),
    }
}
