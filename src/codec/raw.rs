//! Reference frame writers.
//!
//! Header record payload: u32 magic, u8 stream kind, u8 pixel format,
//! u16 reserved, u32 width, u32 height. Frame record payload: f64 timestamp
//! followed by the pixel bytes (RGB8 verbatim for color, RLE+differential
//! coded depths for depth). All little-endian.

use super::{FrameShape, FrameWriter, put_record, rle};
use crate::error::{Error, Result};
use crate::types::{FrameBuffer, FrameKind, Pixels};

/// Identifies a depthcast codec header record.
pub const CODEC_MAGIC: u32 = 0x44435331; // "DCS1"

const FORMAT_RGB8: u8 = 0;
const FORMAT_DEPTH_RLE: u8 = 1;

fn header_payload(shape: &FrameShape, format: u8) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16);
    payload.extend_from_slice(&CODEC_MAGIC.to_le_bytes());
    payload.push(match shape.kind {
        FrameKind::Color => 0,
        FrameKind::Depth => 1,
    });
    payload.push(format);
    payload.extend_from_slice(&[0u8; 2]);
    payload.extend_from_slice(&shape.width.to_le_bytes());
    payload.extend_from_slice(&shape.height.to_le_bytes());
    payload
}

fn check_shape(frame: &FrameBuffer, shape: &FrameShape) -> Result<()> {
    if frame.kind != shape.kind || frame.width != shape.width || frame.height != shape.height {
        return Err(Error::Codec(format!(
            "frame shape {:?} {}x{} does not match writer shape {:?} {}x{}",
            frame.kind, frame.width, frame.height, shape.kind, shape.width, shape.height
        )));
    }
    Ok(())
}

/// Pass-through color writer: RGB8 pixels verbatim.
pub struct RawColorWriter {
    shape: FrameShape,
}

impl RawColorWriter {
    pub fn new(shape: FrameShape) -> Self {
        Self { shape }
    }
}

impl FrameWriter for RawColorWriter {
    fn write_header(&mut self, sink: &mut Vec<u8>) -> Result<()> {
        put_record(sink, &header_payload(&self.shape, FORMAT_RGB8));
        Ok(())
    }

    fn write_frame(&mut self, frame: &FrameBuffer, sink: &mut Vec<u8>) -> Result<()> {
        check_shape(frame, &self.shape)?;
        let Pixels::Rgb(rgb) = &frame.pixels else {
            return Err(Error::Codec("color writer fed non-RGB pixels".into()));
        };
        let mut payload = Vec::with_capacity(8 + rgb.len());
        payload.extend_from_slice(&frame.timestamp.to_le_bytes());
        payload.extend_from_slice(rgb);
        put_record(sink, &payload);
        Ok(())
    }
}

/// Depth writer using the run-length + differential scheme from
/// [`crate::codec::rle`].
pub struct RleDepthWriter {
    shape: FrameShape,
    scratch: Vec<u8>,
}

impl RleDepthWriter {
    pub fn new(shape: FrameShape) -> Self {
        Self {
            shape,
            scratch: Vec::new(),
        }
    }
}

impl FrameWriter for RleDepthWriter {
    fn write_header(&mut self, sink: &mut Vec<u8>) -> Result<()> {
        put_record(sink, &header_payload(&self.shape, FORMAT_DEPTH_RLE));
        Ok(())
    }

    fn write_frame(&mut self, frame: &FrameBuffer, sink: &mut Vec<u8>) -> Result<()> {
        check_shape(frame, &self.shape)?;
        let Pixels::Depth(depths) = &frame.pixels else {
            return Err(Error::Codec("depth writer fed non-depth pixels".into()));
        };
        self.scratch.clear();
        self.scratch.extend_from_slice(&frame.timestamp.to_le_bytes());
        rle::encode(depths, &mut self.scratch);
        put_record(sink, &self.scratch);
        Ok(())
    }
}
