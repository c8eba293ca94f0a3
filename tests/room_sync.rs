use std::time::{Duration, Instant};

use niketsu_server::messages::{Join, ServerMessage};
use niketsu_server::worker::{UserStatus, VideoStatus, Worker};

mod fixture;

async fn join(overseer: &niketsu_server::overseer::Overseer, room: &str, name: &str) -> (Worker, tokio::sync::mpsc::Receiver<ServerMessage>) {
    let uuid = uuid::Uuid::new_v4();
    let (worker, rx) = Worker::new_detached(uuid, 32);
    overseer
        .login(
            &worker,
            Join {
                password: String::new(),
                room: room.to_owned(),
                username: name.to_owned(),
            },
        )
        .await
        .unwrap();
    (worker, rx)
}

#[tokio::test]
async fn desynced_worker_receives_corrective_seek() {
    let dir = tempfile::tempdir().unwrap();
    let overseer = fixture::overseer(&dir);

    let (alice, _alice_rx) = join(&overseer, "movienight", "alice").await;
    let (bob, mut bob_rx) = join(&overseer, "movienight", "bob").await;
    let room = bob.room().unwrap();

    room.select(Some("a.mkv".to_owned()), "alice".to_owned()).await;
    room.start(alice.uuid()).await;

    let now = Instant::now();
    alice.set_video_status(VideoStatus {
        filename: Some("a.mkv".into()),
        position: Some(0),
        paused: false,
        speed: 1.0,
        timestamp: now,
        file_loaded: true,
        cache: false,
    });
    bob.set_video_status(VideoStatus {
        filename: Some("a.mkv".into()),
        position: Some(5000),
        paused: false,
        speed: 1.0,
        timestamp: now,
        file_loaded: true,
        cache: false,
    });

    room.handle_video_status(bob.uuid(), now).await;

    let mut saw_seek = false;
    while let Ok(msg) = bob_rx.try_recv() {
        if matches!(msg, ServerMessage::Seek(s) if s.desync) {
            saw_seek = true;
        }
    }
    assert!(saw_seek, "bob should have been corrected back towards the pack");
}

#[tokio::test]
async fn room_starts_only_once_every_worker_is_ready() {
    let dir = tempfile::tempdir().unwrap();
    let overseer = fixture::overseer(&dir);

    let (alice, mut alice_rx) = join(&overseer, "movienight", "alice").await;
    let (bob, _bob_rx) = join(&overseer, "movienight", "bob").await;
    let room = alice.room().unwrap();

    room.select(Some("a.mkv".to_owned()), "alice".to_owned()).await;
    while alice_rx.try_recv().is_ok() {}

    alice.set_user_status(UserStatus {
        username: "alice".into(),
        ready: true,
    });
    room.broadcast_start_on_ready().await;
    assert!(
        alice_rx.try_recv().is_err(),
        "must not start while bob isn't ready"
    );

    bob.set_user_status(UserStatus {
        username: "bob".into(),
        ready: true,
    });
    room.broadcast_start_on_ready().await;

    let mut started = false;
    while let Ok(msg) = alice_rx.try_recv() {
        if matches!(msg, ServerMessage::Start) {
            started = true;
        }
    }
    assert!(started, "room should start once every worker is ready");
}

#[tokio::test]
async fn non_persistent_room_is_garbage_collected_once_empty() {
    let dir = tempfile::tempdir().unwrap();
    let overseer = fixture::overseer(&dir);

    let (alice, _rx) = join(&overseer, "scratch", "alice").await;
    let room = alice.room().unwrap();
    assert_eq!(room.worker_count().await, 1);

    room.remove_worker(alice.uuid()).await;

    // the room was dropped from the registry once it emptied out; joining
    // the same name again must succeed by creating a fresh one rather than
    // panicking on stale state.
    let (bob, _bob_rx) = join(&overseer, "scratch", "bob").await;
    assert_eq!(bob.room().unwrap().worker_count().await, 1);
}
