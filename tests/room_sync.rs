use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use watchsync::types::room_path;
use watchsync::{
    MemoryStore, Player, PlayerCommand, RoomError, RoomId, Session, SessionHandle, SimPlayer,
    StaticDirectory,
};

const POLL_INTERVAL_MS: u64 = 5;
const POLL_ATTEMPTS: u32 = 400;

fn directory() -> StaticDirectory {
    StaticDirectory::new()
        .with_profile("user-ada", "Ada")
        .with_profile("user-grace", "Grace")
        .with_profile("user-linus", "Linus")
}

struct Participant {
    handle: SessionHandle,
    player: SimPlayer,
    task: tokio::task::JoinHandle<()>,
}

/// Spawns the session loop with a ready player, the way a client embeds one.
fn start(session: Session) -> Participant {
    let handle = session.handle();
    let (player, events) = SimPlayer::new();
    player.mark_ready();
    let task = tokio::spawn(session.run(Box::new(player.clone()), events));
    Participant {
        handle,
        player,
        task,
    }
}

/// Polls `cond` until it holds or a couple of seconds pass.
async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..POLL_ATTEMPTS {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Watches the room document until `cond` accepts a snapshot.
async fn wait_for_doc<F>(store: &MemoryStore, room_id: &RoomId, what: &str, cond: F)
where
    F: Fn(Option<&Value>) -> bool,
{
    let probe = store.connect("probe");
    let mut sub = probe.subscribe(&room_path(room_id)).await.unwrap();
    let watched = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(event) = sub.next().await {
            if cond(event.data.as_ref()) {
                return;
            }
        }
        panic!("subscription ended while waiting for {}", what);
    })
    .await;
    assert!(watched.is_ok(), "timed out waiting for {}", what);
}

async fn read_room(store: &MemoryStore, room_id: &RoomId) -> Option<Value> {
    let probe = store.connect("probe");
    probe.read(&room_path(room_id)).await.unwrap()
}

#[tokio::test]
async fn test_full_watch_party_flow() {
    let store = MemoryStore::new();
    let directory = directory();

    let session = Session::create_room(store.connect("user-ada"), &directory)
        .await
        .unwrap();
    let room_id = session.room_id().clone();
    let mut ada = start(session);

    let session = Session::join_room(store.connect("user-grace"), &directory, room_id.clone())
        .await
        .unwrap();
    let grace = start(session);

    // Both participants appear in the member list right away.
    let doc = read_room(&store, &room_id).await.unwrap();
    assert_eq!(doc["members"]["user-ada"]["displayName"], "Ada");
    assert_eq!(doc["members"]["user-grace"]["displayName"], "Grace");

    // Admin selects the video; every player loads it paused.
    ada.handle.load_video("vid-1").await.unwrap();
    let player = ada.player.clone();
    eventually("ada's player to load the video", move || {
        player.loaded().as_deref() == Some("vid-1")
    })
    .await;
    let player = grace.player.clone();
    eventually("grace's player to load the video", move || {
        player.loaded().as_deref() == Some("vid-1")
    })
    .await;
    assert!(!grace.player.is_playing());

    // Admin presses play on the local player; viewers follow.
    ada.player.play();
    let player = grace.player.clone();
    eventually("grace's player to start", move || player.is_playing()).await;

    // Admin pauses mid-way; viewers land on the same frame.
    ada.player.advance(42.5);
    ada.player.pause();
    let player = grace.player.clone();
    eventually("grace's player to pause at 42.5", move || {
        !player.is_playing() && (player.position() - 42.5).abs() < 1e-9
    })
    .await;

    // Ending the room releases every player and removes the document.
    ada.handle.end_room().await.unwrap();
    let player = grace.player.clone();
    eventually("grace's player to release", move || player.loaded().is_none()).await;
    ada.task.await.unwrap();
    grace.task.await.unwrap();
    assert_eq!(read_room(&store, &room_id).await, None);
}

#[tokio::test]
async fn test_join_unknown_room_fails() {
    let store = MemoryStore::new();
    let directory = directory();
    let room_id = RoomId::parse("ZZZZZ").unwrap();
    let err = Session::join_room(store.connect("user-grace"), &directory, room_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::RoomNotFound(_)));
}

#[tokio::test]
async fn test_viewer_cannot_drive_the_transport() {
    let store = MemoryStore::new();
    let directory = directory();

    let session = Session::create_room(store.connect("user-ada"), &directory)
        .await
        .unwrap();
    let room_id = session.room_id().clone();
    let ada = start(session);

    let session = Session::join_room(store.connect("user-grace"), &directory, room_id.clone())
        .await
        .unwrap();
    let grace = start(session);

    let err = grace.handle.load_video("vid-hijack").await.unwrap_err();
    assert!(matches!(err, RoomError::Unauthorized));

    let doc = read_room(&store, &room_id).await.unwrap();
    assert!(doc.get("videoRef").is_none());

    ada.handle.end_room().await.unwrap();
    ada.task.await.unwrap();
    grace.task.await.unwrap();
}

#[tokio::test]
async fn test_chat_fans_out_in_order() {
    let store = MemoryStore::new();
    let directory = directory();

    let session = Session::create_room(store.connect("user-ada"), &directory)
        .await
        .unwrap();
    let room_id = session.room_id().clone();
    let ada = start(session);

    let session = Session::join_room(store.connect("user-grace"), &directory, room_id.clone())
        .await
        .unwrap();
    let grace = start(session);

    ada.handle.send_chat("movie night!").await.unwrap();
    grace.handle.send_chat("popcorn ready").await.unwrap();
    ada.handle.send_chat("starting in a minute").await.unwrap();

    wait_for_doc(&store, &room_id, "all three chat messages", |doc| {
        let texts: Vec<&str> = doc
            .and_then(|doc| doc.get("chat"))
            .and_then(Value::as_object)
            .map(|chat| {
                chat.values()
                    .filter_map(|entry| entry["text"].as_str())
                    .collect()
            })
            .unwrap_or_default();
        texts == ["movie night!", "popcorn ready", "starting in a minute"]
    })
    .await;

    // Senders are stamped store-side from the connection identity.
    let doc = read_room(&store, &room_id).await.unwrap();
    let senders: Vec<&str> = doc["chat"]
        .as_object()
        .unwrap()
        .values()
        .filter_map(|entry| entry["senderId"].as_str())
        .collect();
    assert_eq!(senders, vec!["user-ada", "user-grace", "user-ada"]);

    ada.handle.end_room().await.unwrap();
    ada.task.await.unwrap();
    grace.task.await.unwrap();
}

#[tokio::test]
async fn test_admin_disconnect_ends_the_party() {
    let store = MemoryStore::new();
    let directory = directory();

    let session = Session::create_room(store.connect("user-ada"), &directory)
        .await
        .unwrap();
    let room_id = session.room_id().clone();
    let ada = start(session);

    let session = Session::join_room(store.connect("user-grace"), &directory, room_id.clone())
        .await
        .unwrap();
    let grace = start(session);

    ada.handle.load_video("vid-1").await.unwrap();
    let player = grace.player.clone();
    eventually("grace's player to load the video", move || {
        player.loaded().is_some()
    })
    .await;

    // The admin client vanishes without saying goodbye.
    ada.task.abort();
    drop(ada.handle);
    drop(ada.player);

    let player = grace.player.clone();
    eventually("grace's player to release after the admin drop", move || {
        player.loaded().is_none()
    })
    .await;
    grace.task.await.unwrap();
    assert_eq!(read_room(&store, &room_id).await, None);
}

#[tokio::test]
async fn test_viewer_disconnect_removes_member() {
    let store = MemoryStore::new();
    let directory = directory();

    let session = Session::create_room(store.connect("user-ada"), &directory)
        .await
        .unwrap();
    let room_id = session.room_id().clone();
    let ada = start(session);

    let session = Session::join_room(store.connect("user-grace"), &directory, room_id.clone())
        .await
        .unwrap();
    let grace = start(session);

    grace.task.abort();
    drop(grace.handle);
    drop(grace.player);

    wait_for_doc(&store, &room_id, "grace to drop off the member list", |doc| {
        doc.map(|doc| doc["members"].get("user-grace").is_none())
            .unwrap_or(false)
    })
    .await;

    // The room itself survives a viewer loss.
    let doc = read_room(&store, &room_id).await.unwrap();
    assert_eq!(doc["active"], true);

    ada.handle.end_room().await.unwrap();
    ada.task.await.unwrap();
}

#[tokio::test]
async fn test_viewer_leave_keeps_party_running() {
    let store = MemoryStore::new();
    let directory = directory();

    let session = Session::create_room(store.connect("user-ada"), &directory)
        .await
        .unwrap();
    let room_id = session.room_id().clone();
    let ada = start(session);

    let session = Session::join_room(store.connect("user-linus"), &directory, room_id.clone())
        .await
        .unwrap();
    let linus = start(session);

    linus.handle.leave().await.unwrap();
    linus.task.await.unwrap();

    let doc = read_room(&store, &room_id).await.unwrap();
    assert!(doc["members"].get("user-linus").is_none());
    assert_eq!(doc["active"], true);

    ada.handle.end_room().await.unwrap();
    ada.task.await.unwrap();
}

#[tokio::test]
async fn test_admin_leave_ends_room_for_everyone() {
    let store = MemoryStore::new();
    let directory = directory();

    let session = Session::create_room(store.connect("user-ada"), &directory)
        .await
        .unwrap();
    let room_id = session.room_id().clone();
    let ada = start(session);

    let session = Session::join_room(store.connect("user-grace"), &directory, room_id.clone())
        .await
        .unwrap();
    let grace = start(session);

    ada.handle.leave().await.unwrap();

    let player = grace.player.clone();
    eventually("grace's session to wind down", move || {
        player.loaded().is_none()
    })
    .await;
    ada.task.await.unwrap();
    grace.task.await.unwrap();
    assert_eq!(read_room(&store, &room_id).await, None);
}

#[tokio::test]
async fn test_late_joiner_syncs_to_current_state() {
    let store = MemoryStore::new();
    let directory = directory();

    let session = Session::create_room(store.connect("user-ada"), &directory)
        .await
        .unwrap();
    let room_id = session.room_id().clone();
    let mut ada = start(session);

    ada.handle.load_video("vid-1").await.unwrap();
    let player = ada.player.clone();
    eventually("ada's player to load the video", move || {
        player.loaded().is_some()
    })
    .await;
    ada.player.play();
    ada.player.advance(42.5);
    ada.player.seek(42.5);

    wait_for_doc(&store, &room_id, "the seek to publish", |doc| {
        doc.and_then(|doc| doc["playbackPositionSeconds"].as_f64()) == Some(42.5)
    })
    .await;

    // Grace joins mid-playback and lands on the admin's frame, playing.
    let session = Session::join_room(store.connect("user-grace"), &directory, room_id.clone())
        .await
        .unwrap();
    let grace = start(session);
    let player = grace.player.clone();
    eventually("grace to sync to the live position", move || {
        player.is_playing() && (player.position() - 42.5).abs() < 1e-9
    })
    .await;

    let commands = grace.player.commands();
    assert_eq!(
        commands[0],
        PlayerCommand::Load {
            video_ref: "vid-1".to_string(),
            position: 42.5
        }
    );
    assert_eq!(commands[1], PlayerCommand::Play);

    ada.handle.end_room().await.unwrap();
    ada.task.await.unwrap();
    grace.task.await.unwrap();
}
