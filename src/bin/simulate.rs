use log::info;
use tokio::time::{sleep, Duration};
use watchsync::{MemoryStore, Player, RoomError, Session, SimPlayer, StaticDirectory};

const STEP_MS: u64 = 50; // pacing between scripted user actions

async fn step() {
    sleep(Duration::from_millis(STEP_MS)).await;
}

#[tokio::main]
async fn main() -> Result<(), RoomError> {
    // Initialize logger with default level INFO (can override with RUST_LOG env var)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let store = MemoryStore::new();
    let directory = StaticDirectory::new()
        .with_profile("user-ada", "Ada")
        .with_profile("user-grace", "Grace")
        .with_profile("user-linus", "Linus");

    // Ada opens a room and shares its id.
    let session = Session::create_room(store.connect("user-ada"), &directory).await?;
    let room_id = session.room_id().clone();
    let ada = session.handle();
    let (mut ada_player, ada_events) = SimPlayer::new();
    ada_player.mark_ready();
    let ada_loop = tokio::spawn(session.run(Box::new(ada_player.clone()), ada_events));
    info!("Ada opened room {}", room_id);

    // Grace and Linus join with the shared id.
    let session = Session::join_room(store.connect("user-grace"), &directory, room_id.clone()).await?;
    let grace = session.handle();
    let (grace_player, grace_events) = SimPlayer::new();
    grace_player.mark_ready();
    let grace_loop = tokio::spawn(session.run(Box::new(grace_player.clone()), grace_events));

    let session = Session::join_room(store.connect("user-linus"), &directory, room_id.clone()).await?;
    let linus = session.handle();
    let (linus_player, linus_events) = SimPlayer::new();
    linus_player.mark_ready();
    let linus_loop = tokio::spawn(session.run(Box::new(linus_player.clone()), linus_events));
    step().await;

    // Ada picks the movie; every player loads it paused at the start.
    ada.load_video("https://videos.example/first-contact").await?;
    step().await;

    // Ada presses play on her own player; the transport write fans out and
    // the viewers follow.
    ada_player.play();
    step().await;

    grace.send_chat("movie night!").await?;
    linus.send_chat("popcorn ready").await?;
    step().await;

    // Half a minute in, Ada skips ahead and then pauses for a break. The
    // pause carries the position, so both viewers land on the same frame.
    ada_player.advance(30.0);
    ada_player.seek(42.5);
    step().await;
    ada_player.pause();
    step().await;

    info!(
        "Positions now: Ada {:.1}s, Grace {:.1}s, Linus {:.1}s",
        ada_player.position(),
        grace_player.position(),
        linus_player.position()
    );

    // Linus heads out; the party continues without him.
    linus.leave().await?;
    step().await;

    // Ada ends the night for everyone.
    ada.end_room().await?;
    let _ = tokio::join!(ada_loop, grace_loop, linus_loop);

    info!(
        "After shutdown: Grace's player released: {}, Linus's player released: {}",
        grace_player.loaded().is_none(),
        linus_player.loaded().is_none()
    );
    Ok(())
}
