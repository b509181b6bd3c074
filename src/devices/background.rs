//! Background model for depth-frame filtering.
//!
//! The background is a per-pixel minimum-depth image. Capture accumulates
//! the pointwise minimum over a requested number of frames; removal replaces
//! any sample at or behind the background (biased by a fuzz value) with the
//! invalid-depth sentinel.

use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::types::INVALID_DEPTH;

/// Called from the decoder thread when a background capture completes.
pub type CaptureDoneCallback = Box<dyn FnOnce() + Send>;

/// Minimum-depth identity for capture accumulation.
const DEPTH_MAX: u16 = 0xffff;

pub struct Background {
    width: u32,
    height: u32,
    frame: Option<Box<[u16]>>,
    pending_frames: u32,
    done_callback: Option<CaptureDoneCallback>,
}

impl Background {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame: None,
            pending_frames: 0,
            done_callback: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.frame.is_some()
    }

    pub fn capturing(&self) -> bool {
        self.pending_frames > 0
    }

    fn len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Begin capturing `n_frames` depth frames into the background.
    ///
    /// With `replace` the model starts fresh; otherwise captured minima are
    /// folded into the existing background pointwise.
    pub fn start_capture(&mut self, n_frames: u32, replace: bool, done: Option<CaptureDoneCallback>) {
        if replace || self.frame.is_none() {
            self.frame = Some(vec![DEPTH_MAX; self.len()].into_boxed_slice());
        }
        self.pending_frames = n_frames;
        self.done_callback = done;
        if n_frames == 0
            && let Some(cb) = self.done_callback.take()
        {
            cb();
        }
    }

    /// Fold one decoded depth frame into an in-progress capture. Invokes the
    /// completion callback when this was the last requested frame.
    pub fn accumulate(&mut self, samples: &[u16]) {
        if self.pending_frames == 0 {
            return;
        }
        if let Some(frame) = self.frame.as_deref_mut() {
            for (b, &s) in frame.iter_mut().zip(samples) {
                *b = (*b).min(s);
            }
        }
        self.pending_frames -= 1;
        if self.pending_frames == 0 {
            log::info!("Background capture complete");
            if let Some(cb) = self.done_callback.take() {
                cb();
            }
        }
    }

    /// Clamp the background so any depth at or beyond `max_depth` is treated
    /// as background. With `replace` (or no existing background) the whole
    /// model becomes the flat plane at `max_depth`.
    pub fn set_max_depth(&mut self, max_depth: u16, replace: bool) {
        if replace || self.frame.is_none() {
            self.frame = Some(vec![max_depth; self.len()].into_boxed_slice());
            return;
        }
        for b in self.frame.as_deref_mut().unwrap() {
            *b = (*b).min(max_depth);
        }
    }

    /// Apply background removal in place: any sample with
    /// `sample + fuzz >= background` (background nonzero) becomes
    /// [`INVALID_DEPTH`].
    pub fn remove(&self, samples: &mut [u16], fuzz: i32) {
        let Some(frame) = self.frame.as_deref() else {
            return;
        };
        for (s, &b) in samples.iter_mut().zip(frame) {
            if b != 0 && *s as i32 + fuzz >= b as i32 {
                *s = INVALID_DEPTH;
            }
        }
    }

    /// Persist the background: u32 width, u32 height, then width*height
    /// little-endian u16 values, row-major.
    pub fn save(&self, sink: &mut impl Write) -> Result<()> {
        let Some(frame) = self.frame.as_deref() else {
            return Err(Error::Config("no background captured to save".to_string()));
        };
        sink.write_all(&self.width.to_le_bytes())?;
        sink.write_all(&self.height.to_le_bytes())?;
        for &v in frame {
            sink.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    /// Load a previously saved background. The stored dimensions must match
    /// the session's depth frame size.
    pub fn load(&mut self, source: &mut impl Read) -> Result<()> {
        let mut u32buf = [0u8; 4];
        source.read_exact(&mut u32buf)?;
        let width = u32::from_le_bytes(u32buf);
        source.read_exact(&mut u32buf)?;
        let height = u32::from_le_bytes(u32buf);
        if width != self.width || height != self.height {
            return Err(Error::Config(format!(
                "background size {}x{} does not match depth frame size {}x{}",
                width, height, self.width, self.height
            )));
        }

        let mut frame = vec![0u16; self.len()].into_boxed_slice();
        let mut u16buf = [0u8; 2];
        for v in frame.iter_mut() {
            source.read_exact(&mut u16buf)?;
            *v = u16::from_le_bytes(u16buf);
        }
        self.frame = Some(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_capture_accumulates_minimum() {
        let mut bg = Background::new(2, 2);
        bg.start_capture(3, true, None);
        bg.accumulate(&[100, 200, 300, 400]);
        bg.accumulate(&[150, 180, 310, 390]);
        bg.accumulate(&[120, 220, 290, 410]);
        assert!(!bg.capturing());

        let mut samples = [100u16, 180, 290, 390];
        bg.remove(&mut samples, 0);
        assert_eq!(samples, [100, INVALID_DEPTH, INVALID_DEPTH, INVALID_DEPTH]);
    }

    #[test]
    fn test_recapture_without_replace_keeps_prior_minimum() {
        let mut bg = Background::new(2, 1);
        bg.start_capture(1, true, None);
        bg.accumulate(&[100, 500]);

        // Second capture without replace folds into the prior background.
        bg.start_capture(1, false, None);
        bg.accumulate(&[300, 200]);

        let mut samples = [100u16, 200];
        bg.remove(&mut samples, 0);
        // min(100,300)=100 and min(500,200)=200: both samples sit on it.
        assert_eq!(samples, [INVALID_DEPTH, INVALID_DEPTH]);
    }

    #[test]
    fn test_capture_completion_callback() {
        let mut bg = Background::new(1, 1);
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        bg.start_capture(2, true, Some(Box::new(move || f.store(true, Ordering::SeqCst))));

        bg.accumulate(&[10]);
        assert!(!fired.load(Ordering::SeqCst));
        bg.accumulate(&[20]);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_removal_fuzz_and_zero_background() {
        let mut bg = Background::new(3, 1);
        bg.start_capture(1, true, None);
        bg.accumulate(&[0, 500, 500]);

        // Zero background pixels never remove; positive fuzz removes more
        // aggressively.
        let mut samples = [400u16, 496, 490];
        bg.remove(&mut samples, 5);
        assert_eq!(samples, [400, INVALID_DEPTH, 490]);
    }

    #[test]
    fn test_max_depth_clamps_existing() {
        let mut bg = Background::new(2, 1);
        bg.start_capture(1, true, None);
        bg.accumulate(&[100, 900]);
        bg.set_max_depth(600, false);

        let mut samples = [600u16, 650];
        bg.remove(&mut samples, 0);
        assert_eq!(samples, [INVALID_DEPTH, INVALID_DEPTH]);
    }

    #[test]
    fn test_max_depth_replace_builds_flat_background() {
        let mut bg = Background::new(2, 1);
        bg.set_max_depth(500, true);
        let mut samples = [499u16, 500];
        bg.remove(&mut samples, 0);
        assert_eq!(samples, [499, INVALID_DEPTH]);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut bg = Background::new(2, 2);
        bg.start_capture(1, true, None);
        bg.accumulate(&[1, 2, 3, 4]);

        let mut bytes = Vec::new();
        bg.save(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 8 + 4 * 2);

        let mut loaded = Background::new(2, 2);
        loaded.load(&mut bytes.as_slice()).unwrap();
        let mut samples = [1u16, 1, 1, 1];
        loaded.remove(&mut samples, 0);
        assert_eq!(samples, [INVALID_DEPTH, 1, 1, 1]);
    }

    #[test]
    fn test_load_rejects_size_mismatch() {
        let mut bg = Background::new(2, 2);
        bg.start_capture(1, true, None);
        bg.accumulate(&[1, 2, 3, 4]);
        let mut bytes = Vec::new();
        bg.save(&mut bytes).unwrap();

        let mut other = Background::new(4, 4);
        assert!(other.load(&mut bytes.as_slice()).is_err());
    }
}
