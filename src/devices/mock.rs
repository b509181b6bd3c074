//! Simulated sensor devices.
//!
//! `MockHub` stands in for the USB bus: it hands out `MockSensor` devices
//! whose isochronous streams replay frames pushed through a [`MockFeed`].
//! The simulated hub doubles as the development backend (synthetic moving
//! scenes) and as the deterministic frame source for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::packet::{FLAG_BASE_COLOR, FLAG_BASE_DEPTH, HEADER_LEN, PacketHeader, POS_END, POS_MIDDLE, POS_START};
use super::{
    DeviceHub, IsoHandle, IsoParams, IsoStream, PacketRead, SensorDevice, SensorMode, decode,
};
use crate::error::{Error, Result};
use crate::types::{CameraExtrinsics, CameraIntrinsics, FrameKind};

/// Frames queued beyond this are dropped oldest-first, so a feeder that
/// outruns the consumer cannot grow without bound.
const FEED_QUEUE_CAP: usize = 8;

/// One raw frame queued for delivery, with optional injected packet loss.
struct QueuedFrame {
    wire: Vec<u8>,
    drop_middle_packet: bool,
}

struct FeedQueue {
    frames: Mutex<VecDeque<QueuedFrame>>,
}

impl FeedQueue {
    fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, frame: QueuedFrame) {
        let mut frames = self.frames.lock();
        if frames.len() >= FEED_QUEUE_CAP {
            frames.pop_front();
        }
        frames.push_back(frame);
    }

    fn pop(&self) -> Option<QueuedFrame> {
        self.frames.lock().pop_front()
    }
}

struct MockSensorShared {
    color: FeedQueue,
    depth: FeedQueue,
    mode: Mutex<Option<SensorMode>>,
    gone: AtomicBool,
}

/// Frame-injection handle for a [`MockSensor`].
#[derive(Clone)]
pub struct MockFeed {
    shared: Arc<MockSensorShared>,
}

impl MockFeed {
    /// Queue one raw Bayer color frame (width*height bytes on the wire).
    pub fn push_color(&self, mosaic: Vec<u8>) {
        self.shared.color.push(QueuedFrame {
            wire: mosaic,
            drop_middle_packet: false,
        });
    }

    /// Queue a color frame whose middle packet will be lost in transit.
    pub fn push_color_lossy(&self, mosaic: Vec<u8>) {
        self.shared.color.push(QueuedFrame {
            wire: mosaic,
            drop_middle_packet: true,
        });
    }

    /// Queue one depth frame, packing `samples` to the encoding the device
    /// was configured for (11-bit packed, or RLE+differential).
    pub fn push_depth(&self, samples: &[u16]) {
        let compress = self
            .shared
            .mode
            .lock()
            .as_ref()
            .map(|m| m.compress_depth)
            .unwrap_or(true);
        let mut wire = Vec::new();
        if compress {
            crate::codec::rle::encode(samples, &mut wire);
        } else {
            decode::pack_depth11(samples, &mut wire);
        }
        self.shared.depth.push(QueuedFrame {
            wire,
            drop_middle_packet: false,
        });
    }

    /// Simulate the device vanishing from the bus.
    pub fn unplug(&self) {
        self.shared.gone.store(true, Ordering::SeqCst);
    }
}

/// A simulated depth+color sensor.
pub struct MockSensor {
    serial: String,
    shared: Arc<MockSensorShared>,
    intrinsics: CameraIntrinsics,
    extrinsics: CameraExtrinsics,
}

impl MockSensor {
    pub fn new(serial: &str) -> (Self, MockFeed) {
        let shared = Arc::new(MockSensorShared {
            color: FeedQueue::new(),
            depth: FeedQueue::new(),
            mode: Mutex::new(None),
            gone: AtomicBool::new(false),
        });
        let feed = MockFeed {
            shared: Arc::clone(&shared),
        };
        let sensor = Self {
            serial: serial.to_string(),
            shared,
            intrinsics: default_intrinsics(),
            extrinsics: CameraExtrinsics::default(),
        };
        (sensor, feed)
    }

    pub fn with_extrinsics(mut self, extrinsics: CameraExtrinsics) -> Self {
        self.extrinsics = extrinsics;
        self
    }
}

/// Plausible pinhole projections for a simulated sensor.
fn default_intrinsics() -> CameraIntrinsics {
    let mut color = [[0.0; 4]; 4];
    color[0][0] = 525.0;
    color[1][1] = 525.0;
    color[0][2] = 320.0;
    color[1][2] = 240.0;
    color[2][2] = 1.0;
    color[3][2] = 1.0;
    let mut depth = color;
    depth[0][0] = 585.0;
    depth[1][1] = 585.0;
    CameraIntrinsics {
        color_projection: color,
        depth_projection: depth,
    }
}

impl SensorDevice for MockSensor {
    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn configure(&mut self, mode: SensorMode) -> Result<()> {
        if self.shared.gone.load(Ordering::SeqCst) {
            return Err(Error::DeviceGone);
        }
        *self.shared.mode.lock() = Some(mode);
        Ok(())
    }

    fn open_stream(&mut self, kind: FrameKind, params: IsoParams) -> Result<Box<dyn IsoStream>> {
        if self.shared.mode.lock().is_none() {
            return Err(Error::DeviceIo("stream opened before configure".to_string()));
        }
        Ok(Box::new(MockStream {
            kind,
            params,
            shared: Arc::clone(&self.shared),
            handle: IsoHandle::new(params.num_transfers),
            pending: VecDeque::new(),
            sequence: 0,
            device_clock: 0,
        }))
    }

    fn intrinsics(&self) -> CameraIntrinsics {
        self.intrinsics
    }

    fn extrinsics(&self) -> CameraExtrinsics {
        self.extrinsics
    }
}

struct MockStream {
    kind: FrameKind,
    params: IsoParams,
    shared: Arc<MockSensorShared>,
    handle: IsoHandle,
    pending: VecDeque<Vec<u8>>,
    sequence: u16,
    device_clock: u32,
}

impl MockStream {
    /// Split one frame into header-prefixed packets, advancing the rolling
    /// sequence counter. A dropped packet still consumes a sequence number,
    /// which is what makes the receiver see a gap.
    fn packetize(&mut self, frame: QueuedFrame) {
        let flag_base = match self.kind {
            FrameKind::Color => FLAG_BASE_COLOR,
            FrameKind::Depth => FLAG_BASE_DEPTH,
        };
        let chunk = self.params.packet_size - HEADER_LEN;
        let mut chunks: Vec<&[u8]> = frame.wire.chunks(chunk).collect();
        // Every frame spans at least a start and an end packet.
        while chunks.len() < 2 {
            chunks.push(&[]);
        }
        let last = chunks.len() - 1;
        let drop_at = frame.drop_middle_packet.then_some(last / 2).filter(|_| last >= 2);

        self.device_clock = self.device_clock.wrapping_add(1);
        for (i, payload) in chunks.iter().enumerate() {
            let position = if i == 0 {
                POS_START
            } else if i == last {
                POS_END
            } else {
                POS_MIDDLE
            };
            let sequence = self.sequence;
            self.sequence = self.sequence.wrapping_add(1);
            if Some(i) == drop_at {
                continue;
            }

            let mut packet = vec![0u8; HEADER_LEN + payload.len()];
            PacketHeader {
                flags: flag_base | position,
                sequence,
                timestamp: self.device_clock,
            }
            .write(&mut packet);
            packet[HEADER_LEN..].copy_from_slice(payload);
            self.pending.push_back(packet);
        }
    }

    fn queue(&self) -> &FeedQueue {
        match self.kind {
            FrameKind::Color => &self.shared.color,
            FrameKind::Depth => &self.shared.depth,
        }
    }
}

impl IsoStream for MockStream {
    fn read_packet(&mut self, buf: &mut [u8]) -> Result<PacketRead> {
        if self.handle.is_cancelled() {
            // Draining is immediate for a simulated ring.
            self.handle.set_active_transfers(0);
            return Ok(PacketRead::Cancelled);
        }
        if self.shared.gone.load(Ordering::SeqCst) {
            self.handle.set_active_transfers(0);
            return Err(Error::DeviceGone);
        }

        if self.pending.is_empty() {
            match self.queue().pop() {
                Some(frame) => self.packetize(frame),
                None => {
                    thread::sleep(Duration::from_millis(2));
                    return Ok(PacketRead::Timeout);
                }
            }
        }

        let packet = self.pending.pop_front().expect("packetize yields packets");
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(PacketRead::Packet(packet.len()))
    }

    fn handle(&self) -> IsoHandle {
        self.handle.clone()
    }
}

/// The simulated bus.
pub struct MockHub {
    sensors: Vec<MockSensor>,
    feeder: Option<JoinHandle<()>>,
    feeder_stop: Arc<AtomicBool>,
}

impl MockHub {
    /// A hub over explicitly built sensors (tests drive the feeds).
    pub fn new(sensors: Vec<MockSensor>) -> Self {
        Self {
            sensors,
            feeder: None,
            feeder_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A hub whose sensors are fed synthetic moving scenes at `rate_hz`.
    pub fn simulated(serials: &[String], rate_hz: u32) -> Self {
        let mut sensors = Vec::new();
        let mut feeds = Vec::new();
        for serial in serials {
            let (sensor, feed) = MockSensor::new(serial);
            sensors.push(sensor);
            feeds.push(feed);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let feeder_stop = Arc::clone(&stop);
        let interval = Duration::from_millis(1000 / rate_hz.max(1) as u64);
        let feeder = thread::Builder::new()
            .name("mock-feeder".to_string())
            .spawn(move || {
                let (w, h) = SensorMode::default().color_size.dims();
                let mut tick = 0u32;
                while !stop.load(Ordering::SeqCst) {
                    for feed in &feeds {
                        feed.push_color(synthetic_mosaic(w, h, tick));
                        feed.push_depth(&synthetic_depth(w, h, tick));
                    }
                    tick = tick.wrapping_add(1);
                    thread::sleep(interval);
                }
            })
            .expect("spawn mock feeder");

        Self {
            sensors,
            feeder: Some(feeder),
            feeder_stop,
        }
    }
}

impl DeviceHub for MockHub {
    fn enumerate(&mut self) -> Result<Vec<Box<dyn SensorDevice>>> {
        Ok(self
            .sensors
            .drain(..)
            .map(|s| Box::new(s) as Box<dyn SensorDevice>)
            .collect())
    }
}

impl Drop for MockHub {
    fn drop(&mut self) {
        self.feeder_stop.store(true, Ordering::SeqCst);
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
    }
}

/// A drifting gradient mosaic; enough structure to see motion in a viewer.
fn synthetic_mosaic(width: u32, height: u32, tick: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut mosaic = vec![0u8; w * h];
    for (y, row) in mosaic.chunks_mut(w).enumerate() {
        for (x, px) in row.iter_mut().enumerate() {
            *px = ((x + y + tick as usize * 4) & 0xff) as u8;
        }
    }
    mosaic
}

/// A tilted plane sweeping back and forth in depth.
fn synthetic_depth(width: u32, height: u32, tick: u32) -> Vec<u16> {
    let (w, h) = (width as usize, height as usize);
    let sweep = (tick % 128) as u16 * 4;
    let mut depths = vec![0u16; w * h];
    for (y, row) in depths.chunks_mut(w).enumerate() {
        for (x, px) in row.iter_mut().enumerate() {
            *px = (600 + (x / 4 + y / 4) as u16 + sweep).min(0x07fe);
        }
    }
    depths
}
