use std::sync::Arc;
use std::time::Duration;

use niketsu_server::config::Config;
use niketsu_server::overseer::Overseer;
use niketsu_server::store::KeyValueStore;

pub fn overseer(dir: &tempfile::TempDir) -> Overseer {
    let store = KeyValueStore::open(&dir.path().join("db"), Duration::from_secs(1)).unwrap();
    Overseer::new(Arc::new(Config::default()), Arc::new(store))
}
