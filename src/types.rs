//! Core frame and camera parameter types shared across the pipeline.

use std::io::{Read, Write};

use crate::error::Result;

/// The depth value indicating an invalid (or removed) pixel.
///
/// Depth samples are 11-bit, so this sits outside the valid range.
pub const INVALID_DEPTH: u16 = 0x07ff;

/// Which of the two per-camera streams a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Color,
    Depth,
}

impl FrameKind {
    /// Wire frame identifier for camera `index`: `2*index + (0 color | 1 depth)`.
    pub fn frame_id(self, camera_index: u32) -> u32 {
        camera_index * 2
            + match self {
                FrameKind::Color => 0,
                FrameKind::Depth => 1,
            }
    }
}

/// Pixel payload of a decoded frame.
#[derive(Debug, Clone)]
pub enum Pixels {
    /// Interleaved RGB8, `width * height * 3` bytes.
    Rgb(Box<[u8]>),
    /// 11-bit depth samples widened to u16, `width * height` values.
    Depth(Box<[u16]>),
}

/// An immutable decoded frame with a monotonic timestamp.
///
/// Timestamps are seconds since the owning session's frame-timer epoch.
/// Frames are published as `Arc<FrameBuffer>`; contents are read-only once
/// published and shared by all observers until the last one drops its
/// reference.
#[derive(Debug)]
pub struct FrameBuffer {
    pub kind: FrameKind,
    pub width: u32,
    pub height: u32,
    pub timestamp: f64,
    pub pixels: Pixels,
}

impl FrameBuffer {
    /// Borrow the depth samples, if this is a depth frame.
    pub fn depth_samples(&self) -> Option<&[u16]> {
        match &self.pixels {
            Pixels::Depth(d) => Some(d),
            Pixels::Rgb(_) => None,
        }
    }
}

/// One compressed frame as handed from a camera's compression sink to the
/// broadcaster through a triple buffer.
#[derive(Debug, Clone, Default)]
pub struct CompressedFrame {
    /// Monotonically increasing per camera+kind.
    pub index: u32,
    /// Copied from the decoded frame.
    pub timestamp: f64,
    /// Codec-framed bytes for exactly one frame (self-delimiting).
    pub data: Vec<u8>,
}

/// Intrinsic camera parameters: projective transforms for the color and
/// depth imagers, 4x4 row-major.
#[derive(Debug, Clone, Copy)]
pub struct CameraIntrinsics {
    pub color_projection: [[f64; 4]; 4],
    pub depth_projection: [[f64; 4]; 4],
}

/// Extrinsic camera parameters: rigid transform from camera space to world
/// space as a unit quaternion (x, y, z, w) plus a translation.
#[derive(Debug, Clone, Copy)]
pub struct CameraExtrinsics {
    pub rotation: [f64; 4],
    pub translation: [f64; 3],
}

impl Default for CameraIntrinsics {
    fn default() -> Self {
        Self {
            color_projection: IDENTITY4,
            depth_projection: IDENTITY4,
        }
    }
}

impl Default for CameraExtrinsics {
    fn default() -> Self {
        Self {
            rotation: [0.0, 0.0, 0.0, 1.0],
            translation: [0.0; 3],
        }
    }
}

const IDENTITY4: [[f64; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

fn write_projection(m: &[[f64; 4]; 4], sink: &mut impl Write) -> Result<()> {
    for row in m {
        for v in row {
            sink.write_all(&v.to_le_bytes())?;
        }
    }
    Ok(())
}

fn read_f64(source: &mut impl Read) -> Result<f64> {
    let mut buf = [0u8; 8];
    source.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

impl CameraIntrinsics {
    /// Marshal both projections (color first) as 16 little-endian f64 each.
    pub fn write_to(&self, sink: &mut impl Write) -> Result<()> {
        write_projection(&self.color_projection, sink)?;
        write_projection(&self.depth_projection, sink)
    }

    pub fn read_from(source: &mut impl Read) -> Result<Self> {
        let mut ips = Self::default();
        for m in [&mut ips.color_projection, &mut ips.depth_projection] {
            for row in m.iter_mut() {
                for v in row.iter_mut() {
                    *v = read_f64(source)?;
                }
            }
        }
        Ok(ips)
    }
}

impl CameraExtrinsics {
    /// Marshal as quaternion (4 f64) followed by translation (3 f64).
    pub fn write_to(&self, sink: &mut impl Write) -> Result<()> {
        for v in self.rotation.iter().chain(self.translation.iter()) {
            sink.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn read_from(source: &mut impl Read) -> Result<Self> {
        let mut eps = Self::default();
        for v in eps.rotation.iter_mut().chain(eps.translation.iter_mut()) {
            *v = read_f64(source)?;
        }
        Ok(eps)
    }
}
