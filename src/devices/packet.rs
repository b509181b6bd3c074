//! Isochronous packet format and raw frame reassembly.
//!
//! Packet layout (12-byte header, then payload):
//! - bytes 0..2: magic `'R' 'B'`
//! - byte 2: flag byte; high nibble is the stream's flag base (color 0x80,
//!   depth 0x70), low nibble marks the packet position in its frame
//!   (0x1 start, 0x2 middle, 0x5 end)
//! - byte 3: reserved
//! - bytes 4..6: rolling u16 packet sequence counter, little-endian
//! - bytes 6..8: reserved
//! - bytes 8..12: u32 device timestamp, little-endian (informational)

/// Packet header length in bytes.
pub const HEADER_LEN: usize = 12;

pub const PACKET_MAGIC: [u8; 2] = *b"RB";

/// Flag base for color stream packets.
pub const FLAG_BASE_COLOR: u8 = 0x80;
/// Flag base for depth stream packets.
pub const FLAG_BASE_DEPTH: u8 = 0x70;

/// Low-nibble position codes.
pub const POS_START: u8 = 0x1;
pub const POS_MIDDLE: u8 = 0x2;
pub const POS_END: u8 = 0x5;

/// Parsed isochronous packet header.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub flags: u8,
    pub sequence: u16,
    pub timestamp: u32,
}

impl PacketHeader {
    /// Parse a header; `None` for runt or non-magic packets (those are
    /// dropped silently, matching the tolerance of the transfer path).
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < HEADER_LEN || packet[0..2] != PACKET_MAGIC {
            return None;
        }
        Some(Self {
            flags: packet[2],
            sequence: u16::from_le_bytes([packet[4], packet[5]]),
            timestamp: u32::from_le_bytes([packet[8], packet[9], packet[10], packet[11]]),
        })
    }

    pub fn flag_base(&self) -> u8 {
        self.flags & 0xF0
    }

    pub fn position(&self) -> u8 {
        self.flags & 0x0F
    }

    /// Serialize a header into the first [`HEADER_LEN`] bytes of `out`.
    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&PACKET_MAGIC);
        out[2] = self.flags;
        out[3] = 0;
        out[4..6].copy_from_slice(&self.sequence.to_le_bytes());
        out[6..8].copy_from_slice(&[0, 0]);
        out[8..12].copy_from_slice(&self.timestamp.to_le_bytes());
    }
}

/// Outcome of feeding one packet to the assembler: a frame was completed.
#[derive(Debug, Clone, Copy)]
pub struct FrameComplete {
    /// False when a sequence gap or payload overflow was observed while
    /// assembling this frame.
    pub intact: bool,
}

/// Reassembles raw frames from the packet stream of one imager.
///
/// The assembled bytes accumulate in an internal fixed-capacity buffer;
/// after [`FrameAssembler::feed`] reports completion the caller swaps the
/// buffer out (and a recycled one in) via [`FrameAssembler::buffer_mut`].
pub struct FrameAssembler {
    flag_base: u8,
    capacity: usize,
    buf: Vec<u8>,
    in_frame: bool,
    intact: bool,
    next_seq: Option<u16>,
}

impl FrameAssembler {
    pub fn new(flag_base: u8, capacity: usize) -> Self {
        Self {
            flag_base,
            capacity,
            buf: Vec::with_capacity(capacity),
            in_frame: false,
            intact: true,
            next_seq: None,
        }
    }

    /// Feed one packet. Returns `Some` when this packet completed a frame;
    /// the frame bytes are in [`FrameAssembler::buffer_mut`] until the next
    /// `feed`.
    pub fn feed(&mut self, packet: &[u8]) -> Option<FrameComplete> {
        let header = PacketHeader::parse(packet)?;
        if header.flag_base() != self.flag_base {
            return None;
        }

        // Rolling sequence check; any gap taints the frame in progress.
        if let Some(expected) = self.next_seq
            && expected != header.sequence
        {
            self.intact = false;
        }
        self.next_seq = Some(header.sequence.wrapping_add(1));

        let payload = &packet[HEADER_LEN..];
        match header.position() {
            POS_START => {
                if self.in_frame {
                    log::debug!("Frame start while previous frame incomplete; dropping partial");
                }
                self.buf.clear();
                self.in_frame = true;
                self.intact = true;
                self.append(payload);
                None
            }
            POS_MIDDLE => {
                if self.in_frame {
                    self.append(payload);
                }
                None
            }
            POS_END => {
                if !self.in_frame {
                    return None;
                }
                self.append(payload);
                self.in_frame = false;
                Some(FrameComplete {
                    intact: self.intact,
                })
            }
            other => {
                log::debug!("Unknown packet position 0x{:X}", other);
                None
            }
        }
    }

    fn append(&mut self, payload: &[u8]) {
        let room = self.capacity - self.buf.len();
        if payload.len() > room {
            self.intact = false;
        }
        let take = payload.len().min(room);
        self.buf.extend_from_slice(&payload[..take]);
    }

    /// The assembly buffer, for swapping a completed frame out.
    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(flags: u8, seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; HEADER_LEN + payload.len()];
        PacketHeader {
            flags,
            sequence: seq,
            timestamp: 0,
        }
        .write(&mut p);
        p[HEADER_LEN..].copy_from_slice(payload);
        p
    }

    #[test]
    fn test_header_roundtrip() {
        let p = packet(FLAG_BASE_DEPTH | POS_START, 0xBEEF, &[1, 2, 3]);
        let h = PacketHeader::parse(&p).unwrap();
        assert_eq!(h.flag_base(), FLAG_BASE_DEPTH);
        assert_eq!(h.position(), POS_START);
        assert_eq!(h.sequence, 0xBEEF);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut p = packet(FLAG_BASE_COLOR | POS_START, 0, &[]);
        p[0] = b'X';
        assert!(PacketHeader::parse(&p).is_none());
    }

    #[test]
    fn test_assembles_three_packet_frame() {
        let mut asm = FrameAssembler::new(FLAG_BASE_COLOR, 64);
        assert!(asm.feed(&packet(FLAG_BASE_COLOR | POS_START, 0, &[1, 2])).is_none());
        assert!(asm.feed(&packet(FLAG_BASE_COLOR | POS_MIDDLE, 1, &[3, 4])).is_none());
        let done = asm
            .feed(&packet(FLAG_BASE_COLOR | POS_END, 2, &[5]))
            .unwrap();
        assert!(done.intact);
        assert_eq!(asm.buffer_mut().as_slice(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_sequence_gap_taints_frame() {
        let mut asm = FrameAssembler::new(FLAG_BASE_COLOR, 64);
        let _ = asm.feed(&packet(FLAG_BASE_COLOR | POS_START, 0, &[1]));
        // Packet with sequence 1 lost.
        let done = asm
            .feed(&packet(FLAG_BASE_COLOR | POS_END, 2, &[2]))
            .unwrap();
        assert!(!done.intact);
        // Frame is still assembled and delivered.
        assert_eq!(asm.buffer_mut().as_slice(), &[1, 2]);
    }

    #[test]
    fn test_next_frame_recovers_after_gap() {
        let mut asm = FrameAssembler::new(FLAG_BASE_COLOR, 64);
        let _ = asm.feed(&packet(FLAG_BASE_COLOR | POS_START, 0, &[1]));
        let _ = asm.feed(&packet(FLAG_BASE_COLOR | POS_END, 3, &[2]));
        let _ = asm.feed(&packet(FLAG_BASE_COLOR | POS_START, 4, &[7]));
        let done = asm
            .feed(&packet(FLAG_BASE_COLOR | POS_END, 5, &[8]))
            .unwrap();
        assert!(done.intact);
    }

    #[test]
    fn test_foreign_stream_packets_ignored() {
        let mut asm = FrameAssembler::new(FLAG_BASE_COLOR, 64);
        let _ = asm.feed(&packet(FLAG_BASE_COLOR | POS_START, 0, &[1]));
        assert!(asm.feed(&packet(FLAG_BASE_DEPTH | POS_END, 9, &[2])).is_none());
        let done = asm
            .feed(&packet(FLAG_BASE_COLOR | POS_END, 1, &[2]))
            .unwrap();
        assert!(done.intact);
        assert_eq!(asm.buffer_mut().as_slice(), &[1, 2]);
    }

    #[test]
    fn test_overflow_truncates_and_taints() {
        let mut asm = FrameAssembler::new(FLAG_BASE_COLOR, 3);
        let _ = asm.feed(&packet(FLAG_BASE_COLOR | POS_START, 0, &[1, 2]));
        let done = asm
            .feed(&packet(FLAG_BASE_COLOR | POS_END, 1, &[3, 4, 5]))
            .unwrap();
        assert!(!done.intact);
        assert_eq!(asm.buffer_mut().len(), 3);
    }
}
