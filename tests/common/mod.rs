//! Shared wire-protocol helpers for the integration tests: a blocking
//! reader that understands the initialization snapshot and the streaming
//! frame format.

use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

use depthcast::streaming::STREAM_MAGIC;
use depthcast::types::{CameraExtrinsics, CameraIntrinsics};

pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WireReader {
    pub stream: TcpStream,
}

#[derive(Debug)]
pub struct CameraHeader {
    pub color_header: Vec<u8>,
    pub depth_header: Vec<u8>,
    pub intrinsics: CameraIntrinsics,
    pub extrinsics: CameraExtrinsics,
}

#[derive(Debug)]
pub struct Snapshot {
    pub cameras: Vec<CameraHeader>,
}

#[derive(Debug)]
pub struct StreamedFrame {
    pub meta_frame_index: u32,
    pub frame_id: u32,
    pub timestamp: f64,
    pub payload: Vec<u8>,
}

impl WireReader {
    pub fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to server");
        stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        Self { stream }
    }

    pub fn read_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf).expect("read u32");
        u32::from_le_bytes(buf)
    }

    fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).expect("read block");
        buf
    }

    /// One self-delimiting codec record: u32 LE length, then the payload.
    pub fn read_record(&mut self) -> Vec<u8> {
        let len = self.read_u32() as usize;
        self.read_exact(len)
    }

    /// The full initialization snapshot, validating the magic.
    pub fn read_snapshot(&mut self) -> Snapshot {
        assert_eq!(self.read_u32(), STREAM_MAGIC, "bad stream magic");
        let camera_count = self.read_u32();
        let mut cameras = Vec::new();
        for _ in 0..camera_count {
            let color_header = self.read_record();
            let depth_header = self.read_record();
            let params = self.read_exact((16 + 16 + 7) * 8);
            let mut cursor = std::io::Cursor::new(params);
            let intrinsics = CameraIntrinsics::read_from(&mut cursor).unwrap();
            let extrinsics = CameraExtrinsics::read_from(&mut cursor).unwrap();
            cameras.push(CameraHeader {
                color_header,
                depth_header,
                intrinsics,
                extrinsics,
            });
        }
        Snapshot { cameras }
    }

    /// One streamed frame: meta index, frame id, codec-framed blob (whose
    /// payload starts with the f64 timestamp).
    pub fn read_frame(&mut self) -> StreamedFrame {
        let meta_frame_index = self.read_u32();
        let frame_id = self.read_u32();
        let blob = self.read_record();
        assert!(blob.len() >= 8, "frame record too short");
        let timestamp = f64::from_le_bytes(blob[0..8].try_into().unwrap());
        StreamedFrame {
            meta_frame_index,
            frame_id,
            timestamp,
            payload: blob[8..].to_vec(),
        }
    }

    /// Read one complete meta-frame of `frames` frames; asserts they all
    /// carry the same meta index and returns (index, sorted frame ids).
    pub fn read_meta_frame(&mut self, frames: usize) -> (u32, Vec<u32>) {
        let first = self.read_frame();
        let meta = first.meta_frame_index;
        let mut ids = vec![first.frame_id];
        for _ in 1..frames {
            let frame = self.read_frame();
            assert_eq!(frame.meta_frame_index, meta, "meta-frame torn across indices");
            ids.push(frame.frame_id);
        }
        ids.sort_unstable();
        (meta, ids)
    }

    /// True when the server closed the connection (EOF).
    pub fn at_eof(&mut self) -> bool {
        let mut probe = [0u8; 1];
        matches!(self.stream.read(&mut probe), Ok(0))
    }

    /// Assert that nothing arrives within `window`.
    pub fn assert_quiet(&mut self, window: Duration) {
        self.stream.set_read_timeout(Some(window)).unwrap();
        let mut probe = [0u8; 1];
        match self.stream.read(&mut probe) {
            Ok(n) => panic!("expected quiet stream, got {} bytes", n),
            Err(e) => assert!(
                matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ),
                "unexpected error: {}",
                e
            ),
        }
        self.stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    }
}

/// A length-prefixed blob in the codec record format, for feeding
/// hand-built compressed frames straight into a triple buffer.
pub fn record_blob(timestamp: f64, payload: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(4 + 8 + payload.len());
    blob.extend_from_slice(&((8 + payload.len()) as u32).to_le_bytes());
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(payload);
    blob
}
