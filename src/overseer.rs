//! Process-wide state: the room registry, the listener accept loop, login
//! policy, and the global status broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::OverseerError;
use crate::messages::{Join, ServerMessage, StatusList};
use crate::room::Room;
use crate::store::KeyValueStore;
use crate::worker::Worker;

#[derive(Clone)]
pub struct Overseer {
    shared: Arc<Shared>,
}

struct Shared {
    rooms: RwLock<HashMap<String, Room>>,
    tickers: RwLock<HashMap<String, tokio::task::JoinHandle<()>>>,
    config: Arc<Config>,
    store: Arc<KeyValueStore>,
}

impl Overseer {
    pub fn new(config: Arc<Config>, store: Arc<KeyValueStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                rooms: RwLock::new(HashMap::new()),
                tickers: RwLock::new(HashMap::new()),
                config,
                store,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Pre-creates every room the config marks `persistent`, restoring its
    /// snapshot from the store, so it exists (and is listed) even before the
    /// first client joins. The config's list is the source of truth but is
    /// unioned with the store's own record of previously-persistent rooms,
    /// so a room stays known across a restart even if it is (temporarily)
    /// missing from the config file.
    pub async fn restore_persistent_rooms(&self) {
        let mut names: Vec<String> = self
            .shared
            .config
            .rooms
            .iter()
            .filter(|(_, cfg)| cfg.persistent)
            .map(|(name, _)| name.clone())
            .collect();

        match self.shared.store.list_persistent_rooms() {
            Ok(stored) => {
                for name in stored {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
            Err(e) => log::warn!("failed to read persisted room registry: {e}"),
        }

        for name in &names {
            self.get_or_create_room(name, true).await;
        }
        if let Err(e) = self.shared.store.save_persistent_rooms(&names) {
            log::warn!("failed to persist room registry: {e}");
        }
    }

    async fn get_or_create_room(&self, name: &str, persistent: bool) -> Room {
        if let Some(room) = self.shared.rooms.read().await.get(name) {
            return room.clone();
        }
        let mut rooms = self.shared.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }
        let room = Room::new(name.to_owned(), persistent, self.shared.store.clone(), self.clone());
        let ticker = room.spawn_persistence_ticker(self.shared.config.db_update_interval());
        self.shared.tickers.write().await.insert(name.to_owned(), ticker);
        rooms.insert(name.to_owned(), room.clone());
        room
    }

    /// Drops a room from the registry and stops its persistence ticker.
    /// Called by `Room::check_room_state` once a non-persistent room has
    /// emptied out and has no playlist left.
    pub async fn delete_room(&self, name: &str) {
        self.shared.rooms.write().await.remove(name);
        if let Some(ticker) = self.shared.tickers.write().await.remove(name) {
            ticker.abort();
        }
        log::debug!("room '{name}' dropped (empty and non-persistent)");
    }

    fn room_name_allowed(&self, name: &str) -> Result<(), OverseerError> {
        if name.is_empty() {
            return Err(OverseerError::RoomDenied("room name must not be empty".into()));
        }
        if name.len() > self.shared.config.max_room_name_len {
            return Err(OverseerError::RoomDenied("room name too long".into()));
        }
        if let Some(whitelist) = &self.shared.config.room_name_whitelist {
            if !whitelist.iter().any(|allowed| allowed == name) {
                return Err(OverseerError::RoomDenied("room not in whitelist".into()));
            }
        }
        Ok(())
    }

    fn authenticate(&self, password: &str) -> bool {
        match &self.shared.config.password {
            None => true,
            Some(expected) => constant_time_eq(expected.as_bytes(), password.as_bytes()),
        }
    }

    /// Validates a `Join`, creates/looks up the room, and attaches the
    /// worker. Called once per connection, before any other message is
    /// honored (see the worker read loop's `Connected` -> `LoggedIn` gate).
    pub async fn login(&self, worker: &Worker, join: Join) -> Result<(), OverseerError> {
        if !self.authenticate(&join.password) {
            return Err(OverseerError::Auth);
        }
        self.room_name_allowed(&join.room)?;

        let persistent = self
            .shared
            .config
            .rooms
            .get(&join.room)
            .map(|cfg| cfg.persistent)
            .unwrap_or(false);
        let room = self.get_or_create_room(&join.room, persistent).await;
        room.add_worker(worker.clone()).await;
        worker.set_room(room);
        self.broadcast_status().await;
        Ok(())
    }

    /// Recomputes every room's overview and pushes a fresh `Status` to every
    /// connected worker across every room.
    pub async fn broadcast_status(&self) {
        let rooms: Vec<Room> = self.shared.rooms.read().await.values().cloned().collect();
        let mut overviews = Vec::with_capacity(rooms.len());
        for room in &rooms {
            overviews.push(room.overview().await);
        }
        let status = ServerMessage::Status(StatusList { rooms: overviews });
        for room in &rooms {
            room.broadcast_all(&status).await;
        }
    }

    /// Accepts connections until the process receives a shutdown signal,
    /// then drains every room before returning.
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.shared.config.host, self.shared.config.port);
        let listener = TcpListener::bind(&addr).await?;
        log::info!("listening on {addr}");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("shutdown signal received, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("accepted connection from {peer}");
                    let overseer = self.clone();
                    tokio::spawn(async move {
                        crate::worker::run_connection(stream, overseer).await;
                    });
                }
            }
        }

        self.shutdown(self.shared.config.shutdown_timeout()).await;
        Ok(())
    }

    /// Stops every room's persistence ticker, flushes a final snapshot and
    /// closes its workers, then flushes the store — all bounded by
    /// `timeout`. Called once, at the end of `run`.
    pub async fn shutdown(&self, timeout: std::time::Duration) {
        let rooms: Vec<Room> = self.shared.rooms.read().await.values().cloned().collect();

        let tickers: Vec<tokio::task::JoinHandle<()>> =
            self.shared.tickers.write().await.drain().map(|(_, handle)| handle).collect();
        for ticker in tickers {
            ticker.abort();
        }

        let drain = async {
            for room in &rooms {
                room.close().await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            log::warn!("shutdown timed out draining {} room(s) after {:?}", rooms.len(), timeout);
        }

        if let Err(e) = self.shared.store.flush() {
            log::warn!("failed to flush store on shutdown: {e}");
        }
    }
}

/// Avoids leaking password-match timing through a short-circuiting `==`.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"hunter2", b"hunter2"));
        assert!(!constant_time_eq(b"hunter2", b"hunter3"));
        assert!(!constant_time_eq(b"short", b"longer string"));
    }
}
