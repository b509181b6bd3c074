//! depthcast - Multi-camera 3D video broadcast daemon

use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use depthcast::devices::create_hub;
use depthcast::{Config, Error, Result, Server};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("depthcast v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/depthcast.toml".to_string());
    log::info!("Using config: {}", config_path);
    let config = Config::load(&config_path)?;

    let mut hub = create_hub(&config)?;
    let mut server = Server::new(&config, hub.as_mut())?;
    server.start()?;

    if server.camera_count() == 0 {
        log::warn!("No configured cameras found; serving headers only");
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Config(format!("Error setting Ctrl-C handler: {}", e)))?;

    log::info!("depthcast running. Press Ctrl-C to stop.");
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("Shutting down...");
    server.stop();
    log::info!("depthcast stopped");
    Ok(())
}
