//! Embedded, crash-safe key/value store used to snapshot room state.
//!
//! Buckets map onto `sled` trees. `sled` opens its data file under an
//! exclusive lock; since `sled::open` fails immediately rather than blocking
//! when the lock is held, [`KeyValueStore::open`] retries with backoff until
//! `wait_timeout` elapses, turning that immediate failure into the bounded
//! wait the design calls for.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const META_BUCKET: &str = "__niketsu_meta";
const PERSISTENT_ROOMS_KEY: &str = "persistent_rooms";

pub struct KeyValueStore {
    db: sled::Db,
}

impl KeyValueStore {
    /// Opens (creating if absent) the store file at `path`, retrying lock
    /// acquisition until `wait_timeout` elapses.
    pub fn open(path: &Path, wait_timeout: Duration) -> Result<Self, StoreError> {
        let deadline = Instant::now() + wait_timeout;
        let mut backoff = Duration::from_millis(20);
        loop {
            match sled::open(path) {
                Ok(db) => return Ok(Self { db }),
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::Acquire);
                    }
                    log::debug!("store locked, retrying: {err}");
                    std::thread::sleep(backoff.min(deadline.saturating_duration_since(Instant::now())));
                    backoff = (backoff * 2).min(Duration::from_millis(500));
                }
            }
        }
    }

    pub fn close(self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Flushes pending writes without consuming the store, for use during
    /// graceful shutdown where the store is still shared via `Arc`.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn bucket_exists(&self, bucket: &str) -> bool {
        self.db
            .tree_names()
            .iter()
            .any(|name| name.as_ref() == bucket.as_bytes())
    }

    pub fn update(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if bucket.is_empty() || key.is_empty() {
            return Err(StoreError::InvalidArgument);
        }
        let tree = self.db.open_tree(bucket)?;
        tree.insert(key, value)?;
        tree.flush()?;
        Ok(())
    }

    pub fn get_value(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if bucket.is_empty() {
            return Err(StoreError::InvalidArgument);
        }
        if !self.bucket_exists(bucket) {
            return Err(StoreError::BucketMissing(bucket.to_owned()));
        }
        let tree = self.db.open_tree(bucket)?;
        Ok(tree.get(key)?.map(|v| v.to_vec()))
    }

    pub fn delete_key(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        if bucket.is_empty() || key.is_empty() {
            return Err(StoreError::InvalidArgument);
        }
        if !self.bucket_exists(bucket) {
            // absent key is success, even in an absent bucket.
            return Ok(());
        }
        let tree = self.db.open_tree(bucket)?;
        tree.remove(key)?;
        tree.flush()?;
        Ok(())
    }

    pub fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        if bucket.is_empty() {
            return Err(StoreError::InvalidArgument);
        }
        if !self.bucket_exists(bucket) {
            return Err(StoreError::BucketMissing(bucket.to_owned()));
        }
        self.db.drop_tree(bucket)?;
        Ok(())
    }

    /// Atomically writes the three fixed keys a room persists on every tick.
    pub fn update_playlist(
        &self,
        bucket: &str,
        playlist_json: &[u8],
        video: &[u8],
        position_le: [u8; 8],
    ) -> Result<(), StoreError> {
        if bucket.is_empty() {
            return Err(StoreError::InvalidArgument);
        }
        let tree = self.db.open_tree(bucket)?;
        tree.transaction(|tx| {
            tx.insert("playlist", playlist_json)?;
            tx.insert("video", video)?;
            tx.insert("position", &position_le[..])?;
            Ok::<(), sled::transaction::ConflictableTransactionError<()>>(())
        })
        .map_err(|e| StoreError::Io(sled::Error::ReportableBug(e.to_string())))?;
        tree.flush()?;
        Ok(())
    }

    pub fn get_all(&self, bucket: &str) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        if bucket.is_empty() {
            return Err(StoreError::InvalidArgument);
        }
        let tree = self.db.open_tree(bucket)?;
        let mut out = HashMap::new();
        for entry in tree.iter() {
            let (k, v) = entry?;
            out.insert(String::from_utf8_lossy(&k).into_owned(), v.to_vec());
        }
        Ok(out)
    }

    /// Reads the metadata bucket listing rooms configured as persistent, so
    /// a restarted process can rehydrate which rooms to pre-create without
    /// re-reading the config file.
    pub fn list_persistent_rooms(&self) -> Result<Vec<String>, StoreError> {
        match self.get_value(META_BUCKET, PERSISTENT_ROOMS_KEY) {
            Ok(Some(bytes)) => Ok(serde_json::from_slice(&bytes)?),
            Ok(None) => Ok(Vec::new()),
            Err(StoreError::BucketMissing(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub fn save_persistent_rooms(&self, rooms: &[String]) -> Result<(), StoreError> {
        let json = serde_json::to_vec(rooms)?;
        self.update(META_BUCKET, PERSISTENT_ROOMS_KEY, &json)
    }
}

/// On-disk shape of a room's persisted snapshot, used by `Room::restore`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedRoom {
    pub playlist: Vec<String>,
    pub video: Option<String>,
    pub position: Option<u64>,
}

impl KeyValueStore {
    pub fn read_room(&self, bucket: &str) -> PersistedRoom {
        let playlist = self
            .get_value(bucket, "playlist")
            .ok()
            .flatten()
            .and_then(|bytes| serde_json::from_slice::<Vec<String>>(&bytes).ok())
            .unwrap_or_default();
        let video = self
            .get_value(bucket, "video")
            .ok()
            .flatten()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .filter(|s| !s.is_empty());
        let position = self
            .get_value(bucket, "position")
            .ok()
            .flatten()
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_le_bytes)
            .filter(|&p| p != 0);
        PersistedRoom {
            playlist,
            video,
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_tmp() -> (KeyValueStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = KeyValueStore::open(&dir.path().join("db"), Duration::from_secs(1)).unwrap();
        (store, dir)
    }

    #[test]
    fn update_then_get_round_trips() {
        let (store, _dir) = open_tmp();
        store.update("room1", "playlist", b"[\"a.mkv\"]").unwrap();
        let got = store.get_value("room1", "playlist").unwrap();
        assert_eq!(got, Some(b"[\"a.mkv\"]".to_vec()));
    }

    #[test]
    fn get_value_missing_key_is_none() {
        let (store, _dir) = open_tmp();
        store.update("room1", "playlist", b"[]").unwrap();
        assert_eq!(store.get_value("room1", "video").unwrap(), None);
    }

    #[test]
    fn get_value_missing_bucket_errors() {
        let (store, _dir) = open_tmp();
        assert!(matches!(
            store.get_value("nope", "key"),
            Err(StoreError::BucketMissing(_))
        ));
    }

    #[test]
    fn delete_bucket_missing_errors() {
        let (store, _dir) = open_tmp();
        assert!(matches!(
            store.delete_bucket("nope"),
            Err(StoreError::BucketMissing(_))
        ));
    }

    #[test]
    fn delete_key_missing_is_ok() {
        let (store, _dir) = open_tmp();
        store.update("room1", "playlist", b"[]").unwrap();
        assert!(store.delete_key("room1", "missing").is_ok());
    }

    #[test]
    fn update_playlist_writes_three_keys_atomically() {
        let (store, _dir) = open_tmp();
        store
            .update_playlist("room1", b"[\"a.mkv\",\"b.mkv\"]", b"a.mkv", 1500u64.to_le_bytes())
            .unwrap();

        let playlist = store.get_value("room1", "playlist").unwrap().unwrap();
        let video = store.get_value("room1", "video").unwrap().unwrap();
        let position = store.get_value("room1", "position").unwrap().unwrap();

        assert_eq!(playlist, b"[\"a.mkv\",\"b.mkv\"]");
        assert_eq!(video, b"a.mkv");
        assert_eq!(u64::from_le_bytes(position.try_into().unwrap()), 1500);
    }

    #[test]
    fn read_room_resets_corrupt_fields_to_default() {
        let (store, _dir) = open_tmp();
        store.update("room1", "playlist", b"not json").unwrap();
        let restored = store.read_room("room1");
        assert_eq!(restored.playlist, Vec::<String>::new());
    }

    #[test]
    fn invalid_argument_on_empty_bucket_or_key() {
        let (store, _dir) = open_tmp();
        assert!(matches!(
            store.update("", "key", b"v"),
            Err(StoreError::InvalidArgument)
        ));
        assert!(matches!(
            store.update("bucket", "", b"v"),
            Err(StoreError::InvalidArgument)
        ));
    }

    #[test]
    fn persistent_rooms_round_trip() {
        let (store, _dir) = open_tmp();
        assert!(store.list_persistent_rooms().unwrap().is_empty());
        store
            .save_persistent_rooms(&["keep".to_owned(), "lounge".to_owned()])
            .unwrap();
        assert_eq!(
            store.list_persistent_rooms().unwrap(),
            vec!["keep".to_owned(), "lounge".to_owned()]
        );
    }
}
