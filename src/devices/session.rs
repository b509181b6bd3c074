//! Per-camera device session.
//!
//! Owns the sensor device, drives one transfer pump and one decoder thread
//! per stream, reassembles raw frames from isochronous packets and delivers
//! decoded frames through the user's stream callbacks.
//!
//! # Threading
//!
//! - The **pump** thread is the transfer-completion context: it reads
//!   packets from the [`IsoStream`], feeds the [`FrameAssembler`], and on
//!   end-of-frame swaps the assembled buffer into the handoff slot and
//!   signals the decoder. It never blocks beyond the brief slot swap.
//! - The **decoder** thread waits on the handoff condvar, decodes the raw
//!   frame (demosaic / 11-bit unpack / RLE decode), applies background
//!   capture and removal for depth, and invokes the stream callback.
//!
//! Raw frame buffers are recycled by swapping; all allocation happens at
//! stream start.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::background::{Background, CaptureDoneCallback};
use super::packet::{FLAG_BASE_COLOR, FLAG_BASE_DEPTH, FrameAssembler};
use super::{IsoHandle, IsoParams, IsoStream, PacketRead, SensorDevice, SensorMode, decode};
use crate::error::{Error, Result};
use crate::types::{CameraExtrinsics, CameraIntrinsics, FrameBuffer, FrameKind, Pixels};

/// Callback invoked once per successfully reassembled and decoded frame.
pub type StreamCallback = Box<dyn FnMut(Arc<FrameBuffer>) + Send>;

/// Handoff slot between a stream's pump and its decoder.
///
/// The pump swaps its assembled buffer in; the decoder swaps its scratch
/// buffer out. A fresh frame that the decoder did not reach in time is
/// overwritten (the decoders are lossy-tolerant by design).
struct RawHandoff {
    slot: Mutex<RawSlot>,
    ready: Condvar,
}

struct RawSlot {
    buf: Vec<u8>,
    timestamp: f64,
    intact: bool,
    fresh: bool,
}

struct RawMeta {
    timestamp: f64,
    intact: bool,
}

impl RawHandoff {
    fn new(capacity: usize) -> Self {
        Self {
            slot: Mutex::new(RawSlot {
                buf: Vec::with_capacity(capacity),
                timestamp: 0.0,
                intact: true,
                fresh: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Publish an assembled frame: swap `active` with the slot buffer and
    /// signal the decoder. `active` comes back cleared, holding the
    /// recycled allocation.
    fn publish(&self, active: &mut Vec<u8>, timestamp: f64, intact: bool) {
        {
            let mut slot = self.slot.lock();
            if slot.fresh {
                log::trace!("Decoder behind; dropping undecoded raw frame");
            }
            mem::swap(&mut slot.buf, active);
            slot.timestamp = timestamp;
            slot.intact = intact;
            slot.fresh = true;
        }
        self.ready.notify_one();
        active.clear();
    }

    /// Wait for a fresh frame, swap it into `scratch`. `None` on cancel.
    fn wait_take(&self, scratch: &mut Vec<u8>, cancel: &AtomicBool) -> Option<RawMeta> {
        let mut slot = self.slot.lock();
        while !slot.fresh {
            if cancel.load(Ordering::SeqCst) {
                return None;
            }
            self.ready.wait_for(&mut slot, Duration::from_millis(100));
        }
        if cancel.load(Ordering::SeqCst) {
            return None;
        }
        mem::swap(&mut slot.buf, scratch);
        slot.fresh = false;
        Some(RawMeta {
            timestamp: slot.timestamp,
            intact: slot.intact,
        })
    }

    fn wake(&self) {
        self.ready.notify_all();
    }
}

/// State the decoder threads share with the session's control surface.
struct SessionShared {
    background: Mutex<Background>,
    remove_background: AtomicBool,
    fuzz: AtomicI32,
}

struct Streamer {
    cancel: Arc<AtomicBool>,
    handoff: Arc<RawHandoff>,
    iso: IsoHandle,
    pump: Option<JoinHandle<()>>,
    decoder: Option<JoinHandle<()>>,
}

/// Session lifecycle. Transfer rings and threads exist only while
/// `Streaming`; `stop` tears everything down before re-entering `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Streaming,
}

pub struct CameraSession {
    device: Box<dyn SensorDevice>,
    mode: SensorMode,
    epoch: Instant,
    shared: Arc<SessionShared>,
    streamers: Vec<Streamer>,
    state: SessionState,
}

impl CameraSession {
    /// Wrap an opened sensor device. [`CameraSession::configure`] must be
    /// called before [`CameraSession::start`].
    pub fn new(device: Box<dyn SensorDevice>) -> Self {
        let (dw, dh) = SensorMode::default().depth_size.dims();
        Self {
            device,
            mode: SensorMode::default(),
            epoch: Instant::now(),
            shared: Arc::new(SessionShared {
                background: Mutex::new(Background::new(dw, dh)),
                remove_background: AtomicBool::new(false),
                fuzz: AtomicI32::new(0),
            }),
            streamers: Vec::new(),
            state: SessionState::Idle,
        }
    }

    pub fn serial_number(&self) -> &str {
        self.device.serial_number()
    }

    pub fn intrinsics(&self) -> CameraIntrinsics {
        self.device.intrinsics()
    }

    pub fn extrinsics(&self) -> CameraExtrinsics {
        self.device.extrinsics()
    }

    /// Select frame sizes, rates and the on-wire depth encoding. Must be
    /// called before `start`.
    pub fn configure(&mut self, mode: SensorMode) {
        self.mode = mode;
        let (dw, dh) = mode.depth_size.dims();
        *self.shared.background.lock() = Background::new(dw, dh);
    }

    /// Frame dimensions of one stream under the configured mode.
    pub fn frame_dims(&self, kind: FrameKind) -> (u32, u32) {
        match kind {
            FrameKind::Color => self.mode.color_size.dims(),
            FrameKind::Depth => self.mode.depth_size.dims(),
        }
    }

    /// Reset the frame-timer epoch; subsequent frame timestamps are seconds
    /// since this point.
    pub fn reset_frame_timer(&mut self) {
        self.epoch = Instant::now();
    }

    /// Capture `n_frames` depth frames into the background model.
    pub fn capture_background(
        &mut self,
        n_frames: u32,
        replace: bool,
        done: Option<CaptureDoneCallback>,
    ) {
        self.shared.background.lock().start_capture(n_frames, replace, done);
    }

    pub fn load_background(&mut self, source: &mut impl std::io::Read) -> Result<()> {
        self.shared.background.lock().load(source)
    }

    pub fn save_background(&self, sink: &mut impl std::io::Write) -> Result<()> {
        self.shared.background.lock().save(sink)
    }

    pub fn set_max_depth(&mut self, max_depth: u16, replace: bool) {
        self.shared.background.lock().set_max_depth(max_depth, replace);
    }

    pub fn set_remove_background(&mut self, remove: bool) {
        self.shared.remove_background.store(remove, Ordering::SeqCst);
    }

    pub fn remove_background(&self) -> bool {
        self.shared.remove_background.load(Ordering::SeqCst)
    }

    /// Positive values remove more aggressively.
    pub fn set_background_removal_fuzz(&mut self, fuzz: i32) {
        self.shared.fuzz.store(fuzz, Ordering::SeqCst);
    }

    pub fn background_removal_fuzz(&self) -> i32 {
        self.shared.fuzz.load(Ordering::SeqCst)
    }

    /// Negotiate the configured mode with the device and start both
    /// streams. Each decoder invokes its callback exactly once per
    /// reassembled frame.
    pub fn start(&mut self, color_cb: StreamCallback, depth_cb: StreamCallback) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::DeviceIo("session already streaming".to_string()));
        }
        self.device.configure(self.mode)?;

        for (kind, cb) in [(FrameKind::Color, color_cb), (FrameKind::Depth, depth_cb)] {
            let streamer = self.start_stream(kind, cb)?;
            self.streamers.push(streamer);
        }
        self.state = SessionState::Streaming;
        Ok(())
    }

    fn start_stream(&mut self, kind: FrameKind, callback: StreamCallback) -> Result<Streamer> {
        let params = IsoParams::for_kind(kind);
        let stream = self.device.open_stream(kind, params)?;
        let iso = stream.handle();

        let (width, height) = self.frame_dims(kind);
        let raw_capacity = match kind {
            FrameKind::Color => decode::bayer_wire_size(width, height),
            // Compressed depth frames are never larger than unpacked ones.
            FrameKind::Depth => decode::depth11_wire_size(width, height),
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let handoff = Arc::new(RawHandoff::new(raw_capacity));
        let name = match kind {
            FrameKind::Color => "color",
            FrameKind::Depth => "depth",
        };

        let pump = {
            let handoff = Arc::clone(&handoff);
            let cancel = Arc::clone(&cancel);
            let epoch = self.epoch;
            let flag_base = match kind {
                FrameKind::Color => FLAG_BASE_COLOR,
                FrameKind::Depth => FLAG_BASE_DEPTH,
            };
            thread::Builder::new()
                .name(format!("{}-pump", name))
                .spawn(move || {
                    pump_loop(stream, params, flag_base, raw_capacity, epoch, &handoff, &cancel);
                })?
        };

        let decoder = {
            let handoff = Arc::clone(&handoff);
            let cancel = Arc::clone(&cancel);
            let shared = Arc::clone(&self.shared);
            let compress_depth = self.mode.compress_depth;
            thread::Builder::new()
                .name(format!("{}-decode", name))
                .spawn(move || {
                    decoder_loop(
                        kind,
                        width,
                        height,
                        compress_depth,
                        &handoff,
                        &cancel,
                        &shared,
                        callback,
                    );
                })?
        };

        Ok(Streamer {
            cancel,
            handoff,
            iso,
            pump: Some(pump),
            decoder: Some(decoder),
        })
    }

    /// Stop streaming: cancel decoders, cancel outstanding transfers, wait
    /// for them to drain, join all threads. After this returns no further
    /// callback runs and no transfers are active.
    pub fn stop(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        for streamer in &self.streamers {
            streamer.cancel.store(true, Ordering::SeqCst);
            streamer.iso.cancel();
            streamer.handoff.wake();
        }
        for streamer in &mut self.streamers {
            if let Some(pump) = streamer.pump.take()
                && pump.join().is_err()
            {
                log::error!("Pump thread panicked during shutdown");
            }
            if let Some(decoder) = streamer.decoder.take()
                && decoder.join().is_err()
            {
                log::error!("Decoder thread panicked during shutdown");
            }
            debug_assert_eq!(streamer.iso.active_transfers(), 0);
        }
        self.streamers.clear();
        self.state = SessionState::Idle;
    }

    /// Outstanding isochronous transfers across both streams.
    pub fn active_transfers(&self) -> usize {
        self.streamers.iter().map(|s| s.iso.active_transfers()).sum()
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump_loop(
    mut stream: Box<dyn IsoStream>,
    params: IsoParams,
    flag_base: u8,
    raw_capacity: usize,
    epoch: Instant,
    handoff: &RawHandoff,
    cancel: &AtomicBool,
) {
    let mut assembler = FrameAssembler::new(flag_base, raw_capacity);
    let mut packet = vec![0u8; params.packet_size];

    loop {
        match stream.read_packet(&mut packet) {
            Ok(PacketRead::Packet(len)) => {
                if let Some(done) = assembler.feed(&packet[..len]) {
                    let timestamp = epoch.elapsed().as_secs_f64();
                    handoff.publish(assembler.buffer_mut(), timestamp, done.intact);
                }
            }
            Ok(PacketRead::Timeout) => {
                if cancel.load(Ordering::SeqCst) && stream.handle().active_transfers() == 0 {
                    break;
                }
            }
            Ok(PacketRead::Cancelled) => break,
            Err(Error::DeviceGone) => {
                // Fatal to this stream: shut the decoder down too.
                log::error!("Device disappeared; stopping stream");
                cancel.store(true, Ordering::SeqCst);
                handoff.wake();
                break;
            }
            Err(e) => {
                // Transient transfer failure; the ring resubmits.
                log::warn!("Isochronous read error (retrying): {}", e);
            }
        }
    }
    log::debug!("Pump thread exiting");
}

#[allow(clippy::too_many_arguments)]
fn decoder_loop(
    kind: FrameKind,
    width: u32,
    height: u32,
    compress_depth: bool,
    handoff: &RawHandoff,
    cancel: &AtomicBool,
    shared: &SessionShared,
    mut callback: StreamCallback,
) {
    let mut scratch: Vec<u8> = Vec::new();

    while let Some(meta) = handoff.wait_take(&mut scratch, cancel) {
        if !meta.intact {
            log::debug!("Decoding non-intact {:?} frame", kind);
        }

        let pixels = match kind {
            FrameKind::Color => Pixels::Rgb(decode::demosaic_bayer(&scratch, width, height)),
            FrameKind::Depth => {
                let mut depths = vec![0u16; width as usize * height as usize];
                if compress_depth {
                    if let Err(e) = decode::decode_depth_rle(&scratch, &mut depths) {
                        log::warn!("Corrupt compressed depth frame: {}", e);
                    }
                } else {
                    decode::unpack_depth11(&scratch, &mut depths);
                }

                {
                    let mut background = shared.background.lock();
                    if background.capturing() {
                        background.accumulate(&depths);
                    }
                    if shared.remove_background.load(Ordering::SeqCst) && background.exists() {
                        background.remove(&mut depths, shared.fuzz.load(Ordering::SeqCst));
                    }
                }
                Pixels::Depth(depths.into_boxed_slice())
            }
        };

        callback(Arc::new(FrameBuffer {
            kind,
            width,
            height,
            timestamp: meta.timestamp,
            pixels,
        }));
    }
    log::debug!("Decoder thread exiting");
}
