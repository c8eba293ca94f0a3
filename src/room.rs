//! Shared per-room playback state: playlist, current video, authoritative
//! position, and the synchronization policy (drift detection, RTT-compensated
//! seek correction, "start on all ready" gating).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::messages::{RoomOverview, Seek, Select, ServerMessage, UserOverview};
use crate::overseer::Overseer;
use crate::store::KeyValueStore;
use crate::worker::Worker;

/// Clients further apart than this (scaled by speed) trigger a desync seek.
pub const MAX_CLIENT_DIFFERENCE_MS: f64 = 1000.0;

#[derive(Clone)]
pub struct Room {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    persistent: bool,
    state: RwLock<RoomState>,
    workers: RwLock<HashMap<Uuid, Worker>>,
    store: Arc<KeyValueStore>,
    overseer: Overseer,
}

struct RoomState {
    playlist: Vec<String>,
    video: Option<String>,
    position: Option<u64>,
    last_seek: u64,
    paused: bool,
    speed: f64,
}

impl Room {
    /// Creates a room, restoring playlist/video/position from the store if a
    /// prior snapshot exists under this room's bucket.
    pub fn new(name: String, persistent: bool, store: Arc<KeyValueStore>, overseer: Overseer) -> Self {
        let restored = store.read_room(&name);
        let last_seek = restored.position.unwrap_or(0);
        Self {
            shared: Arc::new(Shared {
                name,
                persistent,
                state: RwLock::new(RoomState {
                    playlist: restored.playlist,
                    video: restored.video,
                    position: restored.position,
                    last_seek,
                    paused: true,
                    speed: 1.0,
                }),
                workers: RwLock::new(HashMap::new()),
                store,
                overseer,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_persistent(&self) -> bool {
        self.shared.persistent
    }

    pub async fn worker_count(&self) -> usize {
        self.shared.workers.read().await.len()
    }

    pub async fn is_paused(&self) -> bool {
        self.shared.state.read().await.paused
    }

    // ---- membership -----------------------------------------------------

    pub async fn add_worker(&self, worker: Worker) {
        let mut workers = self.shared.workers.write().await;
        workers.insert(worker.uuid(), worker);
    }

    /// Removes the worker, re-pauses an emptied room, deletes the room if it
    /// is non-persistent and now has an empty playlist, and always tells the
    /// overseer to re-broadcast global status.
    pub async fn remove_worker(&self, uuid: Uuid) {
        {
            let mut workers = self.shared.workers.write().await;
            workers.remove(&uuid);
        }
        self.check_room_state().await;
        self.shared.overseer.broadcast_status().await;
    }

    async fn check_room_state(&self) {
        let empty = self.shared.workers.read().await.is_empty();
        if !empty {
            return;
        }
        let delete = {
            let mut state = self.shared.state.write().await;
            state.paused = true;
            !self.shared.persistent && state.playlist.is_empty()
        };
        if delete {
            self.shared.overseer.delete_room(&self.shared.name).await;
        }
    }

    // ---- broadcast primitives --------------------------------------------

    pub async fn broadcast_all(&self, msg: &ServerMessage) {
        let workers = self.shared.workers.read().await;
        for worker in workers.values() {
            worker.enqueue(msg.clone());
        }
    }

    pub async fn broadcast_except(&self, msg: &ServerMessage, source_uuid: Uuid) {
        let workers = self.shared.workers.read().await;
        for worker in workers.values() {
            if worker.uuid() != source_uuid {
                worker.enqueue(msg.clone());
            }
        }
    }

    async fn send_to(&self, uuid: Uuid, msg: &ServerMessage) {
        let workers = self.shared.workers.read().await;
        if let Some(worker) = workers.get(&uuid) {
            worker.enqueue(msg.clone());
        }
    }

    // ---- simple intents ---------------------------------------------------

    pub async fn start(&self, source_uuid: Uuid) {
        {
            let mut state = self.shared.state.write().await;
            state.paused = false;
        }
        let _ = source_uuid;
        self.broadcast_all(&ServerMessage::Start).await;
    }

    pub async fn pause(&self, source_uuid: Uuid) {
        {
            let mut state = self.shared.state.write().await;
            state.paused = true;
        }
        self.broadcast_except(&ServerMessage::Pause, source_uuid).await;
    }

    pub async fn speed_change(&self, speed: f64, username: String, source_uuid: Uuid) {
        debug_assert!(speed > 0.0);
        {
            let mut state = self.shared.state.write().await;
            state.speed = speed;
        }
        self.broadcast_except(
            &ServerMessage::PlaybackSpeed(crate::messages::PlaybackSpeed { speed, username }),
            source_uuid,
        )
        .await;
    }

    pub async fn chat(&self, message: String, username: String, source_uuid: Uuid) {
        self.broadcast_except(
            &ServerMessage::UserMessage(crate::messages::UserMessage { message, username }),
            source_uuid,
        )
        .await;
    }

    /// `Seek{filename, position}`: only honored if `filename` matches the
    /// currently selected video.
    pub async fn seek(&self, filename: String, position: u64, username: String, source_uuid: Uuid) {
        let (speed, paused) = {
            let mut state = self.shared.state.write().await;
            if state.video.as_deref() != Some(filename.as_str()) {
                return;
            }
            state.position = Some(position);
            state.last_seek = position;
            (state.speed, state.paused)
        };
        self.broadcast_except(
            &ServerMessage::Seek(Seek {
                filename,
                position,
                speed,
                paused,
                desync: false,
                username,
            }),
            source_uuid,
        )
        .await;
    }

    pub async fn select(&self, filename: Option<String>, username: String) {
        {
            let mut state = self.shared.state.write().await;
            state.video = filename.clone();
            state.position = Some(0);
            state.last_seek = 0;
            state.paused = true;
        }
        self.broadcast_all(&ServerMessage::Select(Select {
            filename,
            username,
            position: None,
        }))
        .await;
    }

    /// `Playlist{playlist}`: replaces the playlist, auto-selecting the "next"
    /// element if the new playlist dropped the current video (see
    /// `next_selection`), then broadcasts the new playlist to everyone.
    pub async fn change_playlist(&self, playlist: Vec<String>, username: String) {
        let reselect = {
            let state = self.shared.state.read().await;
            next_selection(&state.playlist, &playlist, state.video.as_deref())
        };

        {
            let mut state = self.shared.state.write().await;
            state.playlist = playlist.clone();
        }

        if let Some(next) = reselect {
            self.select(next, username.clone()).await;
        }

        self.broadcast_all(&ServerMessage::Playlist(crate::messages::Playlist {
            playlist,
            username,
        }))
        .await;
    }

    // ---- drift detection & readiness --------------------------------------

    /// `position == None`: nothing to correlate against the other reports;
    /// the worker's video_status was already updated by the caller, so this
    /// is a no-op hook kept distinct to mirror the design's explicit split
    /// between a known and an unknown playhead.
    pub async fn handle_nil_status(&self, _uuid: Uuid) {}

    /// Recomputes the room's authoritative position from every worker's
    /// self-reported status and realigns the caller if it drifted too far.
    pub async fn handle_video_status(&self, reporter_uuid: Uuid, now: Instant) {
        let workers = self.shared.workers.read().await;
        let mut state = self.shared.state.write().await;

        let mut estimates: Vec<(Uuid, f64)> = Vec::new();
        for worker in workers.values() {
            let status = worker.video_status();
            let Some(position) = status.position else {
                continue;
            };
            let estimated = if status.paused {
                position as f64
            } else {
                position as f64 + now.saturating_duration_since(status.timestamp).as_secs_f64() * 1000.0 * state.speed
            };
            estimates.push((worker.uuid(), estimated));
        }

        if estimates.is_empty() {
            return;
        }

        let min_pos = estimates.iter().map(|(_, p)| *p).fold(f64::INFINITY, f64::min);
        let max_pos = estimates.iter().map(|(_, p)| *p).fold(f64::NEG_INFINITY, f64::max);

        state.position = Some((min_pos.max(state.last_seek as f64)).round() as u64);

        if max_pos - min_pos > MAX_CLIENT_DIFFERENCE_MS * state.speed {
            let Some(reporter) = workers.get(&reporter_uuid) else {
                return;
            };
            let Some(video) = state.video.clone() else {
                return;
            };
            let target_position = state.position.unwrap_or(0);
            let speed = state.speed;
            let paused = state.paused;
            drop(state);
            self.send_seek(reporter, video, target_position, speed, paused, true)
                .await;
        }
    }

    /// Sends a directed (non-broadcast) `Seek`, compensating for the target
    /// worker's RTT when it is not paused.
    async fn send_seek(&self, worker: &Worker, filename: String, position: u64, speed: f64, paused: bool, desync: bool) {
        let position = if paused {
            position
        } else {
            let rtt = worker.round_trip_time();
            position.saturating_add((rtt / 2.0).round() as u64)
        };
        worker.enqueue(ServerMessage::Seek(Seek {
            filename,
            position,
            speed,
            paused,
            desync,
            username: String::new(),
        }));
    }

    /// Only honored if the room has a selected video and every worker has
    /// reported `ready == true`.
    pub async fn broadcast_start_on_ready(&self) {
        let workers = self.shared.workers.read().await;
        let state = self.shared.state.read().await;
        if state.video.is_none() {
            return;
        }
        if workers.is_empty() || !workers.values().all(|w| w.user_status().ready) {
            return;
        }
        drop(state);
        {
            let mut state = self.shared.state.write().await;
            state.paused = false;
        }
        for worker in workers.values() {
            worker.enqueue(ServerMessage::Start);
        }
    }

    /// Tells the overseer to recompute and push the global status broadcast,
    /// e.g. after a worker's readiness or username changes.
    pub async fn notify_status_changed(&self) {
        self.shared.overseer.broadcast_status().await;
    }

    // ---- persistence -------------------------------------------------------

    pub async fn persist(&self) {
        let (playlist_json, video, position_le) = {
            let state = self.shared.state.read().await;
            let playlist_json = match serde_json::to_vec(&state.playlist) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("room {}: failed to serialize playlist: {e}", self.shared.name);
                    return;
                }
            };
            let video = state.video.clone().unwrap_or_default().into_bytes();
            let position_le = state.position.unwrap_or(0).to_le_bytes();
            (playlist_json, video, position_le)
        };
        if let Err(e) = self
            .shared
            .store
            .update_playlist(&self.shared.name, &playlist_json, &video, position_le)
        {
            log::warn!("room {}: persistence tick failed: {e}", self.shared.name);
        }
    }

    /// Flushes a final snapshot and closes every currently connected worker.
    /// Called by `Overseer::shutdown`; the ticker itself must already have
    /// been stopped by the caller before this runs.
    pub async fn close(&self) {
        self.persist().await;
        let workers: Vec<Worker> = self.shared.workers.read().await.values().cloned().collect();
        for worker in workers {
            worker.close();
        }
    }

    /// Spawns the interval ticker that flushes this room's state to the
    /// store. The returned handle may be aborted on room shutdown.
    pub fn spawn_persistence_ticker(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let room = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                room.persist().await;
            }
        })
    }

    // ---- overview for the global Status broadcast -------------------------

    pub async fn overview(&self) -> RoomOverview {
        let workers = self.shared.workers.read().await;
        let state = self.shared.state.read().await;
        let mut users = Vec::with_capacity(workers.len());
        for worker in workers.values() {
            let user_status = worker.user_status();
            let video_status = worker.video_status();
            users.push(UserOverview {
                username: user_status.username,
                ready: user_status.ready,
                file_loaded: video_status.file_loaded,
                position: video_status.position,
                video: state.video.clone(),
                latency: worker.round_trip_time(),
                jitter: worker.jitter(),
            });
        }
        RoomOverview {
            name: self.shared.name.clone(),
            users,
        }
    }
}

/// Walks the old playlist against the new one to find which element should
/// remain/become selected after a playlist replacement. Returns `Some(next)`
/// only when the selection must change (i.e. the current video was dropped
/// from, or reordered out from under, the new playlist).
fn next_selection(old: &[String], new: &[String], current: Option<&str>) -> Option<Option<String>> {
    let Some(current) = current else {
        return None;
    };

    let mut cursor = 0usize;
    let mut next: Option<&str> = None;
    for o in old {
        if o == current {
            break;
        }
        if cursor < new.len() && o == &new[cursor] {
            cursor += 1;
        }
        if cursor >= new.len() {
            cursor = new.len().saturating_sub(1);
            break;
        }
    }
    if !new.is_empty() {
        next = Some(new[cursor.min(new.len() - 1)].as_str());
    }

    match next {
        Some(n) if n != current => Some(Some(n.to_owned())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_selection_same_element_when_present() {
        // old [a,b,c,d], video=c, new [b,c,d] -> stays c, no reselect.
        let old = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        let new = vec!["b".into(), "c".into(), "d".into()];
        assert_eq!(next_selection(&old, &new, Some("c")), None);
    }

    #[test]
    fn next_selection_picks_replacement_when_dropped() {
        // old [a,b,c,d], video=c, new [a,d] -> walk picks d.
        let old = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        let new = vec!["a".into(), "d".into()];
        assert_eq!(
            next_selection(&old, &new, Some("c")),
            Some(Some("d".to_owned()))
        );
    }

    #[test]
    fn next_selection_none_when_no_current_video() {
        let old = vec!["a".into()];
        let new = vec!["b".into()];
        assert_eq!(next_selection(&old, &new, None), None);
    }
}
