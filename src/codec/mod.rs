//! Frame compression sinks.
//!
//! A [`Compressor`] couples an opaque [`FrameWriter`] with an in-memory
//! accumulating sink. Constructing the compressor writes the codec's stream
//! header into the sink; each [`Compressor::write_frame`] appends one
//! self-contained record. [`Compressor::store_buffers`] drains everything
//! accumulated so far into a caller-provided blob, so the first call (made
//! before any frame is written) yields the codec header and every later
//! call yields exactly one frame's compressed bytes.
//!
//! All records are self-delimiting: a little-endian u32 length followed by
//! that many payload bytes. A receiver can skip records it cannot decode.

pub mod raw;
pub mod rle;

use crate::error::Result;
use crate::types::{FrameBuffer, FrameKind};

/// Opaque byte-stream compressor for one stream of decoded frames.
///
/// Implementations write a stream header once and then one record per
/// frame, both in the self-delimiting record format described in the
/// module docs.
pub trait FrameWriter: Send {
    /// Emit the codec's stream header. Called once, before any frame.
    fn write_header(&mut self, sink: &mut Vec<u8>) -> Result<()>;

    /// Emit one frame as a self-contained record.
    fn write_frame(&mut self, frame: &FrameBuffer, sink: &mut Vec<u8>) -> Result<()>;
}

/// The shape a frame writer is constructed for.
#[derive(Debug, Clone, Copy)]
pub struct FrameShape {
    pub kind: FrameKind,
    pub width: u32,
    pub height: u32,
}

/// A frame writer bound to an accumulating byte sink.
pub struct Compressor {
    writer: Box<dyn FrameWriter>,
    sink: Vec<u8>,
}

impl Compressor {
    /// Bind `writer` to a fresh sink and capture the stream header.
    pub fn new(mut writer: Box<dyn FrameWriter>) -> Result<Self> {
        let mut sink = Vec::with_capacity(16384);
        writer.write_header(&mut sink)?;
        Ok(Self { writer, sink })
    }

    /// Compress one decoded frame into the sink.
    pub fn write_frame(&mut self, frame: &FrameBuffer) -> Result<()> {
        self.writer.write_frame(frame, &mut self.sink)
    }

    /// Transfer all accumulated bytes into `out` (replacing its contents)
    /// and reset the sink to empty, retaining its allocation.
    pub fn store_buffers(&mut self, out: &mut Vec<u8>) {
        std::mem::swap(out, &mut self.sink);
        self.sink.clear();
    }
}

/// Append one self-delimiting record: u32 LE length, then the payload.
pub(crate) fn put_record(sink: &mut Vec<u8>, payload: &[u8]) {
    sink.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    sink.extend_from_slice(payload);
}
