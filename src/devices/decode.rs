//! Raw frame decoding: Bayer demosaic for color, 11-bit unpack and
//! RLE+differential decode for depth.

use crate::codec::rle;
use crate::error::Result;

/// Bytes on the wire for an uncompressed 11-bit depth frame.
pub fn depth11_wire_size(width: u32, height: u32) -> usize {
    (width as usize * height as usize * 11).div_ceil(8)
}

/// Bytes on the wire for a raw Bayer color frame.
pub fn bayer_wire_size(width: u32, height: u32) -> usize {
    width as usize * height as usize
}

/// Unpack big-endian 11-bit depth samples into `out`.
///
/// A short (non-intact) input fills the prefix it covers; the tail keeps
/// whatever the caller initialized it to.
pub fn unpack_depth11(raw: &[u8], out: &mut [u16]) {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut i = 0usize;
    for &byte in raw {
        acc = (acc << 8) | byte as u32;
        bits += 8;
        while bits >= 11 {
            if i >= out.len() {
                return;
            }
            bits -= 11;
            out[i] = ((acc >> bits) & 0x07ff) as u16;
            i += 1;
        }
    }
}

/// Decode an RLE+differential compressed depth frame.
pub fn decode_depth_rle(raw: &[u8], out: &mut [u16]) -> Result<()> {
    rle::decode(raw, out)
}

/// Demosaic an RGGB Bayer mosaic into interleaved RGB8.
///
/// Missing channels are averaged from the immediate neighbors that carry
/// them, with edge clamping. A truncated mosaic is treated as zero-padded.
pub fn demosaic_bayer(raw: &[u8], width: u32, height: u32) -> Box<[u8]> {
    let (w, h) = (width as usize, height as usize);
    let mut rgb = vec![0u8; w * h * 3];

    let at = |x: isize, y: isize| -> u32 {
        let x = x.clamp(0, w as isize - 1) as usize;
        let y = y.clamp(0, h as isize - 1) as usize;
        raw.get(y * w + x).copied().unwrap_or(0) as u32
    };

    for y in 0..h {
        for x in 0..w {
            let (xi, yi) = (x as isize, y as isize);
            let even_row = y % 2 == 0;
            let even_col = x % 2 == 0;

            let (r, g, b) = match (even_row, even_col) {
                // Red site.
                (true, true) => (
                    at(xi, yi),
                    (at(xi - 1, yi) + at(xi + 1, yi) + at(xi, yi - 1) + at(xi, yi + 1)) / 4,
                    (at(xi - 1, yi - 1) + at(xi + 1, yi - 1) + at(xi - 1, yi + 1) + at(xi + 1, yi + 1)) / 4,
                ),
                // Green site on a red row.
                (true, false) => (
                    (at(xi - 1, yi) + at(xi + 1, yi)) / 2,
                    at(xi, yi),
                    (at(xi, yi - 1) + at(xi, yi + 1)) / 2,
                ),
                // Green site on a blue row.
                (false, true) => (
                    (at(xi, yi - 1) + at(xi, yi + 1)) / 2,
                    at(xi, yi),
                    (at(xi - 1, yi) + at(xi + 1, yi)) / 2,
                ),
                // Blue site.
                (false, false) => (
                    (at(xi - 1, yi - 1) + at(xi + 1, yi - 1) + at(xi - 1, yi + 1) + at(xi + 1, yi + 1)) / 4,
                    (at(xi - 1, yi) + at(xi + 1, yi) + at(xi, yi - 1) + at(xi, yi + 1)) / 4,
                    at(xi, yi),
                ),
            };

            let o = (y * w + x) * 3;
            rgb[o] = r as u8;
            rgb[o + 1] = g as u8;
            rgb[o + 2] = b as u8;
        }
    }
    rgb.into_boxed_slice()
}

/// Pack depth samples to the big-endian 11-bit wire format (used by the
/// simulated sensor and by fixtures).
pub fn pack_depth11(samples: &[u16], out: &mut Vec<u8>) {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    for &s in samples {
        acc = (acc << 11) | (s & 0x07ff) as u32;
        bits += 11;
        while bits >= 8 {
            bits -= 8;
            out.push(((acc >> bits) & 0xff) as u8);
        }
    }
    if bits > 0 {
        out.push(((acc << (8 - bits)) & 0xff) as u8);
    }
}
