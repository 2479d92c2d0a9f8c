//! lockstream - annotated video stream server with click-to-lock tracking
//!
//! This daemon:
//! 1. Loads configuration (JSON file + environment)
//! 2. Registers the inference engines compiled into this build
//! 3. Serves the video feed and selection API until Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use lockstream::{
    api::{ApiConfig, ApiServer},
    default_registry, LockstreamConfig, StreamStateStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Annotated video streaming with click-to-lock object tracking")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "LOCKSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration.
    #[arg(long)]
    addr: Option<String>,

    /// Default video source, overrides the configuration.
    #[arg(long)]
    source: Option<String>,

    /// List the available inference engines and exit.
    #[arg(long)]
    list_engines: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = LockstreamConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.addr = addr;
    }
    if let Some(source) = args.source {
        config.default_source = source;
    }

    let mut registry = default_registry(config.detection.model_path.clone());
    if args.list_engines {
        for name in registry.list() {
            println!("{}", name);
        }
        return Ok(());
    }
    registry.set_default(&config.detection.engine)?;

    let store = Arc::new(StreamStateStore::new(config.selection_policy));
    let api_handle = ApiServer::new(ApiConfig::from(&config), registry, store).spawn()?;
    log::info!(
        "lockstream running. default source {}, engine {}, ids {}, selection policy {}",
        config.default_source,
        config.detection.engine,
        config.detection.id_mode,
        config.selection_policy
    );
    log::info!("open http://{}/ to view the stream", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("lockstream waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping server...");
    api_handle.stop()?;

    Ok(())
}
