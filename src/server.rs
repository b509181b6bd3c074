//! Server supervisor: builds camera pipelines from configuration, runs the
//! acceptor and broadcaster threads, and orchestrates shutdown.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::buffer::FrameSignal;
use crate::config::{CameraConfig, Config};
use crate::devices::session::CameraSession;
use crate::devices::{DeviceHub, SensorDevice, SensorMode};
use crate::error::{Error, Result};
use crate::streaming::{Acceptor, Broadcaster, BroadcasterHandle, CameraState, ClientList, STREAM_MAGIC};

pub struct Server {
    cameras: Vec<CameraState>,
    clients: Arc<ClientList>,
    signal: Arc<FrameSignal>,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    acceptor: Option<Acceptor>,
    broadcaster: Option<BroadcasterHandle>,
}

impl Server {
    /// Build camera states for every configured camera found on the bus and
    /// bind the listening socket. Configuration errors and a failed bind
    /// abort; a missing camera is logged and skipped.
    pub fn new(config: &Config, hub: &mut dyn DeviceHub) -> Result<Self> {
        let mut devices = hub.enumerate()?;
        log::info!("Enumerated {} sensor devices on bus", devices.len());

        let signal = Arc::new(FrameSignal::new());
        let mut cameras = Vec::new();

        for (name, camera_config) in config.camera_sections() {
            let serial = &camera_config.serial_number;
            let Some(pos) = devices.iter().position(|d| d.serial_number() == serial.as_str()) else {
                log::error!("{}", Error::DeviceNotFound(serial.clone()));
                continue;
            };
            let device = devices.remove(pos);

            log::info!("Creating streamer for camera \"{}\" (serial {})", name, serial);
            let camera = build_camera(device, camera_config, Arc::clone(&signal))?;
            cameras.push(camera);
        }
        log::info!("{} cameras initialized", cameras.len());

        let listener = TcpListener::bind(("0.0.0.0", config.server.listen_port))?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            cameras,
            clients: Arc::new(ClientList::new()),
            signal,
            listener: Some(listener),
            local_addr,
            acceptor: None,
            broadcaster: None,
        })
    }

    /// The bound listen address (resolves port 0 to the actual port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Start the acceptor (always), the broadcaster (when at least one
    /// camera was found), then streaming on every camera.
    pub fn start(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::Config("server already started".to_string()))?;

        let snapshot = Arc::new(self.build_snapshot()?);
        self.acceptor = Some(Acceptor::spawn(
            listener,
            snapshot,
            Arc::clone(&self.clients),
            Arc::new(AtomicBool::new(false)),
        )?);
        log::info!("Listening on {}", self.local_addr);

        if !self.cameras.is_empty() {
            let feeds = self.cameras.iter_mut().map(|c| c.take_feed()).collect();
            let broadcaster = Broadcaster::new(
                feeds,
                Arc::clone(&self.clients),
                Arc::clone(&self.signal),
                Arc::new(AtomicBool::new(false)),
            );
            self.broadcaster = Some(BroadcasterHandle::spawn(broadcaster)?);
        }

        for camera in &mut self.cameras {
            camera.start_streaming()?;
        }
        Ok(())
    }

    /// The complete initialization preamble sent to every new client:
    /// magic, camera count, then each camera's headers and parameters.
    fn build_snapshot(&self) -> Result<Vec<u8>> {
        let mut snapshot = Vec::new();
        snapshot.extend_from_slice(&STREAM_MAGIC.to_le_bytes());
        snapshot.extend_from_slice(&(self.cameras.len() as u32).to_le_bytes());
        for camera in &self.cameras {
            camera.write_headers(&mut snapshot)?;
        }
        Ok(snapshot)
    }

    /// Orderly shutdown: acceptor first, then the broadcaster, then the
    /// camera sessions, then every client socket. Per-step failures are
    /// logged and shutdown continues.
    pub fn stop(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.stop();
        }
        if let Some(broadcaster) = self.broadcaster.take() {
            broadcaster.stop();
        }
        for camera in &mut self.cameras {
            log::debug!("Stopping camera {}", camera.serial_number());
            camera.stop();
        }
        self.clients.close_all();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open a session on `device` and apply the camera section's background
/// configuration, mirroring startup order: load file, capture, max depth,
/// fuzz, enable removal.
fn build_camera(
    device: Box<dyn SensorDevice>,
    config: &CameraConfig,
    signal: Arc<FrameSignal>,
) -> Result<CameraState> {
    let mut session = CameraSession::new(device);
    session.configure(SensorMode {
        compress_depth: config.compress_depth,
        ..SensorMode::default()
    });

    if config.remove_background {
        if let Some(path) = &config.background_file {
            log::info!("Loading background from {}", path);
            let mut file = std::fs::File::open(path)?;
            session.load_background(&mut file)?;
        }
        if config.capture_background_frames > 0 {
            session.capture_background(config.capture_background_frames, false, None);
        }
        if config.max_depth > 0 {
            session.set_max_depth(config.max_depth, false);
        }
        if let Some(fuzz) = config.background_fuzz {
            session.set_background_removal_fuzz(fuzz);
        }
        session.set_remove_background(true);
    }

    CameraState::new(session, signal)
}
