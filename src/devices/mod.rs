//! Sensor device abstraction.
//!
//! The traits here are the seam to the USB layer: enumeration, mode
//! negotiation (control transfers) and isochronous packet delivery all live
//! behind them. The shipped backend is the simulated hub in [`mock`];
//! hardware backends implement the same traits.

pub mod background;
pub mod decode;
pub mod mock;
pub mod packet;
pub mod session;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{CameraExtrinsics, CameraIntrinsics, FrameKind};

/// Frame sizes the imagers can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSize {
    /// 640x480
    Vga,
    /// 1280x1024
    Sxga,
}

impl FrameSize {
    pub fn dims(self) -> (u32, u32) {
        match self {
            FrameSize::Vga => (640, 480),
            FrameSize::Sxga => (1280, 1024),
        }
    }
}

/// Frame rates the imagers can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRate {
    Fps15,
    Fps30,
}

impl FrameRate {
    pub fn hz(self) -> u32 {
        match self {
            FrameRate::Fps15 => 15,
            FrameRate::Fps30 => 30,
        }
    }
}

/// Complete streaming mode negotiated with the device before `start`.
#[derive(Debug, Clone, Copy)]
pub struct SensorMode {
    pub color_size: FrameSize,
    pub color_rate: FrameRate,
    pub depth_size: FrameSize,
    pub depth_rate: FrameRate,
    /// Request run-length + differential compressed depth on the wire.
    pub compress_depth: bool,
}

impl Default for SensorMode {
    fn default() -> Self {
        Self {
            color_size: FrameSize::Vga,
            color_rate: FrameRate::Fps30,
            depth_size: FrameSize::Vga,
            depth_rate: FrameRate::Fps30,
            compress_depth: true,
        }
    }
}

/// Isochronous ring parameters for one stream.
#[derive(Debug, Clone, Copy)]
pub struct IsoParams {
    /// Size of isochronous packets in bytes (including the 12-byte header).
    pub packet_size: usize,
    /// Packets per transfer.
    pub packets_per_transfer: usize,
    /// Size of the transfer ring, sized to ride out scheduling delays.
    pub num_transfers: usize,
}

impl IsoParams {
    /// Ring parameters for a stream of the given kind.
    pub fn for_kind(kind: FrameKind) -> Self {
        match kind {
            FrameKind::Color => Self {
                packet_size: 1920,
                packets_per_transfer: 16,
                num_transfers: 8,
            },
            FrameKind::Depth => Self {
                packet_size: 1760,
                packets_per_transfer: 16,
                num_transfers: 8,
            },
        }
    }
}

/// Result of one isochronous read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketRead {
    /// A packet of this many bytes landed in the buffer.
    Packet(usize),
    /// No packet arrived within the poll interval.
    Timeout,
    /// Cancellation has drained; no further packets will arrive.
    Cancelled,
}

/// Cross-thread handle onto an [`IsoStream`]'s transfer ring.
#[derive(Clone)]
pub struct IsoHandle {
    cancel: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

impl IsoHandle {
    pub fn new(active_transfers: usize) -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(active_transfers)),
        }
    }

    /// Request cancellation of all in-flight transfers.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Transfers still in flight. Zero once cancellation has drained.
    pub fn active_transfers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active_transfers(&self, n: usize) {
        self.active.store(n, Ordering::SeqCst);
    }
}

/// One isochronous endpoint worth of traffic.
///
/// Implementations own the transfer ring: they resubmit completed or failed
/// transfers themselves and surface only packets, timeouts and terminal
/// conditions. After [`IsoHandle::cancel`] they finish draining in-flight
/// transfers, drop the active count to zero, and return
/// [`PacketRead::Cancelled`] from then on.
pub trait IsoStream: Send {
    /// Blocking read of the next packet payload into `buf`.
    ///
    /// Transient transfer failures are retried internally and reported as
    /// `Err(Error::DeviceIo)`; callers log and keep reading. A vanished
    /// device yields `Err(Error::DeviceGone)`.
    fn read_packet(&mut self, buf: &mut [u8]) -> Result<PacketRead>;

    /// Handle for cancelling and observing the transfer ring from another
    /// thread.
    fn handle(&self) -> IsoHandle;
}

/// A depth+color sensor device on the bus.
pub trait SensorDevice: Send {
    fn serial_number(&self) -> &str;

    /// Negotiate the streaming mode (firmware/mode upload, resolution and
    /// rate selection). Must be called before `open_stream`.
    fn configure(&mut self, mode: SensorMode) -> Result<()>;

    /// Open the isochronous stream for one of the two imagers.
    fn open_stream(&mut self, kind: FrameKind, params: IsoParams) -> Result<Box<dyn IsoStream>>;

    fn intrinsics(&self) -> CameraIntrinsics;

    fn extrinsics(&self) -> CameraExtrinsics;
}

/// Device enumeration: everything currently attached to the bus.
pub trait DeviceHub {
    fn enumerate(&mut self) -> Result<Vec<Box<dyn SensorDevice>>>;
}

/// Build the device hub selected by the configuration.
pub fn create_hub(config: &Config) -> Result<Box<dyn DeviceHub>> {
    match config.device.source.as_str() {
        "mock" => {
            let sim = config.device.simulation.as_ref().ok_or_else(|| {
                Error::Config("mock device source requires [device.simulation] section".to_string())
            })?;
            Ok(Box::new(mock::MockHub::simulated(
                &sim.serials,
                sim.frame_rate_hz,
            )))
        }
        other => Err(Error::Config(format!("Unknown device source: {}", other))),
    }
}
