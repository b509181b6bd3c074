//! Camera state: couples a device session to its two compression sinks and
//! publishes compressed frames into the per-stream triple buffers.

use std::sync::Arc;

use crate::buffer::{Consumer, FrameSignal, Producer, triple_buffer};
use crate::codec::raw::{RawColorWriter, RleDepthWriter};
use crate::codec::{Compressor, FrameShape};
use crate::devices::session::CameraSession;
use crate::error::Result;
use crate::types::{CameraExtrinsics, CameraIntrinsics, CompressedFrame, FrameBuffer, FrameKind};

/// Producer-side state moved into a stream callback at start.
struct PipelineEnd {
    compressor: Compressor,
    producer: Producer<CompressedFrame>,
    frame_index: u32,
}

impl PipelineEnd {
    /// Compress one decoded frame and commit it to the triple buffer.
    fn publish(&mut self, frame: &FrameBuffer, signal: &FrameSignal) {
        if let Err(e) = self.compressor.write_frame(frame) {
            log::warn!("Dropping {:?} frame: {}", frame.kind, e);
            return;
        }
        let slot = self.producer.start_new();
        slot.index = self.frame_index;
        slot.timestamp = frame.timestamp;
        self.compressor.store_buffers(&mut slot.data);
        self.producer.post_new();
        signal.notify();
        self.frame_index += 1;
    }
}

/// The broadcaster's view of one camera: both compressed-frame consumers.
pub struct CameraFeed {
    pub color: Consumer<CompressedFrame>,
    pub depth: Consumer<CompressedFrame>,
}

pub struct CameraState {
    session: CameraSession,
    color_headers: Vec<u8>,
    depth_headers: Vec<u8>,
    intrinsics: CameraIntrinsics,
    extrinsics: CameraExtrinsics,
    signal: Arc<FrameSignal>,
    color: Option<PipelineEnd>,
    depth: Option<PipelineEnd>,
    feed: Option<CameraFeed>,
}

impl CameraState {
    /// Build the compression pipeline for a configured session. Codec
    /// header blobs are captured here, before any frame can be produced,
    /// and are frozen from then on.
    pub fn new(session: CameraSession, signal: Arc<FrameSignal>) -> Result<Self> {
        let (cw, ch) = session.frame_dims(FrameKind::Color);
        let (dw, dh) = session.frame_dims(FrameKind::Depth);

        let mut color_compressor = Compressor::new(Box::new(RawColorWriter::new(FrameShape {
            kind: FrameKind::Color,
            width: cw,
            height: ch,
        })))?;
        let mut depth_compressor = Compressor::new(Box::new(RleDepthWriter::new(FrameShape {
            kind: FrameKind::Depth,
            width: dw,
            height: dh,
        })))?;

        let mut color_headers = Vec::new();
        let mut depth_headers = Vec::new();
        color_compressor.store_buffers(&mut color_headers);
        depth_compressor.store_buffers(&mut depth_headers);

        let (color_producer, color_consumer) = triple_buffer();
        let (depth_producer, depth_consumer) = triple_buffer();

        let intrinsics = session.intrinsics();
        let extrinsics = session.extrinsics();

        Ok(Self {
            session,
            color_headers,
            depth_headers,
            intrinsics,
            extrinsics,
            signal,
            color: Some(PipelineEnd {
                compressor: color_compressor,
                producer: color_producer,
                frame_index: 0,
            }),
            depth: Some(PipelineEnd {
                compressor: depth_compressor,
                producer: depth_producer,
                frame_index: 0,
            }),
            feed: Some(CameraFeed {
                color: color_consumer,
                depth: depth_consumer,
            }),
        })
    }

    pub fn session_mut(&mut self) -> &mut CameraSession {
        &mut self.session
    }

    pub fn serial_number(&self) -> &str {
        self.session.serial_number()
    }

    /// Write this camera's share of the initialization snapshot: both codec
    /// header blobs, then the intrinsic projections and the extrinsic
    /// transform.
    pub fn write_headers(&self, sink: &mut impl std::io::Write) -> Result<()> {
        sink.write_all(&self.color_headers)?;
        sink.write_all(&self.depth_headers)?;
        self.intrinsics.write_to(sink)?;
        self.extrinsics.write_to(sink)
    }

    /// Hand the consumer side to the broadcaster. Valid once.
    pub fn take_feed(&mut self) -> CameraFeed {
        self.feed.take().expect("camera feed already taken")
    }

    /// Install the compression callbacks and start the device session.
    pub fn start_streaming(&mut self) -> Result<()> {
        let mut color = self.color.take().expect("streaming already started");
        let mut depth = self.depth.take().expect("streaming already started");
        let color_signal = Arc::clone(&self.signal);
        let depth_signal = Arc::clone(&self.signal);

        self.session.start(
            Box::new(move |frame: Arc<FrameBuffer>| color.publish(&frame, &color_signal)),
            Box::new(move |frame: Arc<FrameBuffer>| depth.publish(&frame, &depth_signal)),
        )
    }

    /// Stop the device session; blocks until all transfers have drained and
    /// both decoder threads are joined.
    pub fn stop(&mut self) {
        self.session.stop();
    }
}
