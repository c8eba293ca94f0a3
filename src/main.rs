use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use niketsu_server::config::Config;
use niketsu_server::overseer::Overseer;
use niketsu_server::store::KeyValueStore;

#[derive(Parser)]
#[command(name = "niketsu-server", about = "Synchronized media-playback relay server")]
struct Opts {
    /// Path to a YAML configuration file. Values fall back to built-in
    /// defaults, then to NIKETSU__-prefixed environment variables.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();

    let config = match Config::load(opts.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(if config.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let store = match KeyValueStore::open(std::path::Path::new(&config.db_path), config.db_wait_timeout()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            log::error!("failed to open store at {}: {e}", config.db_path);
            std::process::exit(2);
        }
    };

    let overseer = Overseer::new(Arc::new(config), store);
    overseer.restore_persistent_rooms().await;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to install ctrl-c handler: {e}");
        }
    };

    if let Err(e) = overseer.run(shutdown).await {
        log::error!("server error: {e}");
        std::process::exit(1);
    }
}
