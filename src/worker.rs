//! Per-connection worker: state machine, read/write/ping loops, and the
//! dispatch table for client messages.

use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::error::{OverseerError, WorkerError};
use crate::messages::{
    decode_client_message, encode_server_message, ClientMessage, PingPong, ReadyStatus,
    ServerMessage,
};
use crate::overseer::Overseer;
use crate::room::Room;

const EWMA_ALPHA: f64 = 0.125;

#[derive(Debug, Clone)]
pub struct UserStatus {
    pub username: String,
    pub ready: bool,
}
impl Default for UserStatus {
    fn default() -> Self {
        Self {
            username: String::new(),
            ready: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoStatus {
    pub filename: Option<String>,
    pub position: Option<u64>,
    pub paused: bool,
    pub speed: f64,
    pub timestamp: Instant,
    pub file_loaded: bool,
    pub cache: bool,
}
impl Default for VideoStatus {
    fn default() -> Self {
        Self {
            filename: None,
            position: None,
            paused: true,
            speed: 1.0,
            timestamp: Instant::now(),
            file_loaded: false,
            cache: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Latency {
    pub round_trip_time: f64,
    pub jitter: f64,
}

/// State machine driving which messages a [`Worker`] will honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    LoggedIn,
    Closing,
}

#[derive(Clone)]
pub struct Worker {
    shared: Arc<Shared>,
}

struct Shared {
    uuid: Uuid,
    state: StdRwLock<ConnectionState>,
    user_status: StdRwLock<UserStatus>,
    video_status: StdRwLock<VideoStatus>,
    latency: StdRwLock<Latency>,
    room: StdRwLock<Option<Room>>,
    send_tx: mpsc::Sender<ServerMessage>,
    close_tx: watch::Sender<bool>,
    last_ping_sent: StdRwLock<Option<Instant>>,
    /// When the currently outstanding (unacknowledged) ping run began.
    /// Set the first time a `Ping` goes out with nothing pending; cleared
    /// the moment any matching `Pong` arrives. Unlike `last_ping_sent`
    /// (which tracks the most recent send, for RTT bookkeeping), this is
    /// not re-stamped on every tick, so the ping loop can measure how long
    /// the peer has gone without acknowledging anything.
    ping_unacked_since: StdRwLock<Option<Instant>>,
    close_reason: StdRwLock<Option<WorkerError>>,
}

impl Worker {
    fn new(uuid: Uuid, send_tx: mpsc::Sender<ServerMessage>, close_tx: watch::Sender<bool>) -> Self {
        Self {
            shared: Arc::new(Shared {
                uuid,
                state: StdRwLock::new(ConnectionState::Connected),
                user_status: StdRwLock::new(UserStatus::default()),
                video_status: StdRwLock::new(VideoStatus::default()),
                latency: StdRwLock::new(Latency::default()),
                room: StdRwLock::new(None),
                send_tx,
                close_tx,
                last_ping_sent: StdRwLock::new(None),
                ping_unacked_since: StdRwLock::new(None),
                close_reason: StdRwLock::new(None),
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.shared.uuid
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read().unwrap()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.shared.state.write().unwrap() = state;
    }

    pub fn user_status(&self) -> UserStatus {
        self.shared.user_status.read().unwrap().clone()
    }

    pub fn video_status(&self) -> VideoStatus {
        self.shared.video_status.read().unwrap().clone()
    }

    pub fn set_video_status(&self, status: VideoStatus) {
        *self.shared.video_status.write().unwrap() = status;
    }

    pub fn set_user_status(&self, status: UserStatus) {
        *self.shared.user_status.write().unwrap() = status;
    }

    pub fn round_trip_time(&self) -> f64 {
        self.shared.latency.read().unwrap().round_trip_time
    }

    pub fn jitter(&self) -> f64 {
        self.shared.latency.read().unwrap().jitter
    }

    pub fn room(&self) -> Option<Room> {
        self.shared.room.read().unwrap().clone()
    }

    /// Best-effort enqueue onto the worker's send queue. A full queue marks
    /// the worker `Closing`; the write loop observes the close signal and
    /// the caller is never blocked on a slow peer (see `BackpressureError`).
    pub fn enqueue(&self, msg: ServerMessage) {
        match self.shared.send_tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("worker {} backpressured, closing", self.shared.uuid);
                self.close_with_reason(WorkerError::Backpressure);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Closes with no specific reason recorded (used for plain EOF/shutdown
    /// paths); see `close_with_reason` for closes that should be attributed.
    pub fn close(&self) {
        self.close_with_reason(WorkerError::Closed);
    }

    /// Marks the connection `Closing` and records why, unless a reason was
    /// already recorded (first reason wins — e.g. a protocol violation
    /// detected in the read loop should not be overwritten by the generic
    /// `Closed` the caller stamps on its way out).
    pub fn close_with_reason(&self, reason: WorkerError) {
        {
            let mut slot = self.shared.close_reason.write().unwrap();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.set_state(ConnectionState::Closing);
        let _ = self.shared.close_tx.send(true);
    }

    /// The reason this worker was closed, if any close has been requested.
    pub fn close_reason(&self) -> Option<WorkerError> {
        self.shared.close_reason.read().unwrap().clone()
    }

    fn record_pong(&self, sample_rtt: f64) {
        let mut latency = self.shared.latency.write().unwrap();
        let prev = latency.round_trip_time;
        latency.round_trip_time = EWMA_ALPHA * sample_rtt + (1.0 - EWMA_ALPHA) * prev;
        latency.jitter = EWMA_ALPHA * (sample_rtt - prev).abs() + (1.0 - EWMA_ALPHA) * latency.jitter;
    }

    /// Records when a server-initiated `Ping` was sent, so a later matching
    /// `Pong` can measure the actual round trip instead of time-since-login.
    /// Also starts the unacked-ping clock if nothing was already pending.
    fn mark_ping_sent(&self, when: Instant) {
        *self.shared.last_ping_sent.write().unwrap() = Some(when);
        let mut unacked = self.shared.ping_unacked_since.write().unwrap();
        if unacked.is_none() {
            *unacked = Some(when);
        }
    }

    /// Consumes the pending ping timestamp (if any), feeds the elapsed time
    /// into the RTT/jitter EWMA, and clears the unacked-ping clock.
    fn record_pong_received(&self, now: Instant) {
        let sent = self.shared.last_ping_sent.write().unwrap().take();
        if let Some(sent) = sent {
            self.record_pong(now.saturating_duration_since(sent).as_secs_f64() * 1000.0);
        }
        *self.shared.ping_unacked_since.write().unwrap() = None;
    }

    /// How long the peer has gone without acknowledging any outstanding
    /// `Ping`, or `None` if the last `Ping` sent (if any) was acknowledged.
    fn ping_unacked_for(&self, now: Instant) -> Option<Duration> {
        self.shared
            .ping_unacked_since
            .read()
            .unwrap()
            .map(|since| now.saturating_duration_since(since))
    }
}

/// Drives one accepted connection end to end: handshake, login, dispatch,
/// and cleanup. Spawns the write and ping tasks and runs the read loop on
/// the calling task.
pub async fn run_connection(stream: TcpStream, overseer: Overseer) {
    let uuid = Uuid::new_v4();
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::info!("worker {uuid}: websocket handshake failed: {e}");
            return;
        }
    };
    let (ws_tx, ws_rx) = ws.split();

    let (send_tx, send_rx) = mpsc::channel(overseer.config().send_queue_capacity);
    let (close_tx, close_rx) = watch::channel(false);
    let worker = Worker::new(uuid, send_tx, close_tx);

    let write_task = tokio::spawn(write_loop(ws_tx, send_rx, close_rx.clone()));
    let ping_task = tokio::spawn(ping_loop(
        worker.clone(),
        overseer.config().ping_interval(),
        overseer.config().pong_timeout(),
        close_rx.clone(),
    ));

    read_loop(ws_rx, worker.clone(), overseer.clone(), close_rx).await;

    worker.close();
    if let Some(room) = worker.room() {
        room.remove_worker(worker.uuid()).await;
    }
    let _ = write_task.await;
    ping_task.abort();
    match worker.close_reason() {
        Some(WorkerError::Protocol(msg)) => log::info!("worker {uuid}: protocol error, closing: {msg}"),
        Some(WorkerError::Auth) => log::info!("worker {uuid}: authentication failed, closing"),
        Some(WorkerError::RoomDenied(msg)) => log::info!("worker {uuid}: room denied, closing: {msg}"),
        Some(WorkerError::Backpressure) => log::warn!("worker {uuid}: backpressured, closing"),
        Some(WorkerError::Closed) | None => log::info!("worker {uuid}: connection closed"),
    }
}

async fn write_loop(
    mut ws_tx: futures::stream::SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    mut send_rx: mpsc::Receiver<ServerMessage>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = close_rx.changed() => {
                if *close_rx.borrow() {
                    break;
                }
            }
            msg = send_rx.recv() => {
                let Some(msg) = msg else { break };
                match encode_server_message(&msg) {
                    Ok(text) => {
                        if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!("failed to encode server message: {e}"),
                }
            }
        }
    }
    let _ = ws_tx.close().await;
}

async fn ping_loop(worker: Worker, interval: Duration, pong_timeout: Duration, mut close_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = close_rx.changed() => {
                if *close_rx.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                if let Some(unacked) = worker.ping_unacked_for(now) {
                    if unacked > pong_timeout {
                        log::info!("worker {} missed pong for {unacked:?}, closing", worker.uuid());
                        worker.close();
                        return;
                    }
                }
                worker.mark_ping_sent(now);
                worker.enqueue(ServerMessage::Ping(PingPong { uuid: worker.uuid() }));
            }
        }
    }
}

async fn read_loop(
    mut ws_rx: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
    worker: Worker,
    overseer: Overseer,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = close_rx.changed() => {
                if *close_rx.borrow() {
                    return;
                }
                continue;
            }
            frame = ws_rx.next() => frame,
        };
        let Some(frame) = frame else {
            return;
        };
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => return,
            Ok(_) => continue,
            Err(e) => {
                log::info!("worker {}: socket error: {e}", worker.uuid());
                return;
            }
        };

        let msg = match decode_client_message(&text) {
            Ok(msg) => msg,
            Err(e) => {
                worker.close_with_reason(WorkerError::Protocol(e.to_string()));
                return;
            }
        };

        if worker.state() == ConnectionState::Connected {
            match msg {
                ClientMessage::Ping(p) => worker.enqueue(ServerMessage::Pong(p)),
                ClientMessage::Pong(_) => {}
                ClientMessage::Join(join) => {
                    match overseer.login(&worker, join).await {
                        Ok(()) => worker.set_state(ConnectionState::LoggedIn),
                        Err(e) => {
                            worker.close_with_reason(worker_error_from_overseer(e));
                            return;
                        }
                    }
                }
                _ => {
                    worker.close_with_reason(WorkerError::Protocol("message sent before login".into()));
                    return;
                }
            }
            continue;
        }

        if let Err(e) = dispatch(&worker, msg).await {
            worker.close_with_reason(e);
            return;
        }
    }
}

/// Maps a room-join failure onto the closer-grained `WorkerError` taxonomy
/// used for the connection-close reason.
fn worker_error_from_overseer(err: OverseerError) -> WorkerError {
    match err {
        OverseerError::Auth => WorkerError::Auth,
        OverseerError::RoomDenied(msg) => WorkerError::RoomDenied(msg),
        OverseerError::Store(e) => WorkerError::Protocol(format!("store error: {e}")),
    }
}

/// Handles one decoded message from an already-logged-in worker. Returns
/// `Err` only for `Join` (a protocol violation once logged in) or if the
/// worker somehow has no room assigned; every other branch is infallible by
/// construction.
async fn dispatch(worker: &Worker, msg: ClientMessage) -> Result<(), WorkerError> {
    let Some(room) = worker.room() else {
        return Err(WorkerError::Protocol("dispatch called without an assigned room".into()));
    };
    let uuid = worker.uuid();

    match msg {
        ClientMessage::Ping(p) => worker.enqueue(ServerMessage::Pong(p)),
        ClientMessage::Pong(p) => {
            if p.uuid == uuid {
                worker.record_pong_received(Instant::now());
            }
        }
        ClientMessage::Join(_) => {
            return Err(WorkerError::Protocol("Join received after login".into()))
        }
        ClientMessage::VideoStatus(status) => {
            let now = Instant::now();
            {
                let mut video_status = worker.shared.video_status.write().unwrap();
                *video_status = VideoStatus {
                    filename: status.filename,
                    position: status.position,
                    paused: status.paused,
                    speed: status.speed,
                    timestamp: now,
                    file_loaded: status.file_loaded,
                    cache: status.cache,
                };
            }
            if status.position.is_none() {
                room.handle_nil_status(uuid).await;
            } else {
                room.handle_video_status(uuid, now).await;
            }
        }
        ClientMessage::Status(ReadyStatus { ready, username }) => {
            let became_ready = {
                let mut user_status = worker.shared.user_status.write().unwrap();
                let became_ready = ready && !user_status.ready;
                user_status.ready = ready;
                user_status.username = username;
                became_ready
            };
            if became_ready && room.is_paused().await {
                room.broadcast_start_on_ready().await;
            }
            room.notify_status_changed().await;
        }
        ClientMessage::Start => room.start(uuid).await,
        ClientMessage::Pause => room.pause(uuid).await,
        ClientMessage::Seek(seek) => room.seek(seek.filename, seek.position, seek.username, uuid).await,
        ClientMessage::Select(select) => room.select(select.filename, select.username).await,
        ClientMessage::Playlist(playlist) => room.change_playlist(playlist.playlist, playlist.username).await,
        ClientMessage::PlaybackSpeed(speed) => room.speed_change(speed.speed, speed.username, uuid).await,
        ClientMessage::UserMessage(chat) => room.chat(chat.message, chat.username, uuid).await,
    }
    Ok(())
}

impl Worker {
    /// Assigns the room this worker joined; called once by `Overseer::login`.
    pub(crate) fn set_room(&self, room: Room) {
        *self.shared.room.write().unwrap() = Some(room);
    }

    /// Builds a worker with no backing socket. Everything `enqueue` would
    /// have written to the wire instead lands on the returned receiver, so
    /// test harnesses can exercise room/overseer logic without a live
    /// connection.
    pub fn new_detached(uuid: Uuid, queue_capacity: usize) -> (Worker, mpsc::Receiver<ServerMessage>) {
        let (send_tx, send_rx) = mpsc::channel(queue_capacity);
        let (close_tx, _close_rx) = watch::channel(false);
        (Worker::new(uuid, send_tx, close_tx), send_rx)
    }
}
