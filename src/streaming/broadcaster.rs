//! Meta-frame assembly and TCP fan-out.
//!
//! The broadcaster collects one fresh color and one fresh depth frame from
//! every camera per meta-frame, serving cameras in fixed index order so no
//! camera starves. Frames the broadcaster did not get to in time are
//! dropped inside the triple buffers; each meta-frame carries the then
//! latest committed frame of each stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::camera::CameraFeed;
use super::wire::ClientList;
use crate::buffer::FrameSignal;
use crate::error::Result;

struct FeedState {
    feed: CameraFeed,
    has_sent_color: bool,
    has_sent_depth: bool,
}

pub struct Broadcaster {
    feeds: Vec<FeedState>,
    clients: Arc<ClientList>,
    signal: Arc<FrameSignal>,
    shutdown: Arc<AtomicBool>,
    meta_frame_index: u32,
}

impl Broadcaster {
    pub fn new(
        feeds: Vec<CameraFeed>,
        clients: Arc<ClientList>,
        signal: Arc<FrameSignal>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            feeds: feeds
                .into_iter()
                .map(|feed| FeedState {
                    feed,
                    has_sent_color: false,
                    has_sent_depth: false,
                })
                .collect(),
            clients,
            signal,
            shutdown,
            meta_frame_index: 0,
        }
    }

    /// The streaming loop. Returns when the shutdown flag is observed at
    /// one of its cancellation points (the new-frame wait or between
    /// per-client writes).
    pub fn run(&mut self) {
        let num_cameras = self.feeds.len();
        if num_cameras == 0 {
            return;
        }
        let mut missing_color = num_cameras;
        let mut missing_depth = num_cameras;

        loop {
            while missing_color > 0 || missing_depth > 0 {
                // Read the generation before scanning so a commit landing
                // mid-scan is never waited out.
                let generation = self.signal.current();
                let mut found_frame = false;

                for i in 0..num_cameras {
                    if self.shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    let state = &mut self.feeds[i];
                    if !state.has_sent_color && state.feed.color.lock_new() {
                        let frame = state.feed.color.locked();
                        log::trace!(
                            "meta {} camera {} color #{} t={:.3}",
                            self.meta_frame_index,
                            i,
                            frame.index,
                            frame.timestamp
                        );
                        fan_out(
                            &self.clients,
                            &self.shutdown,
                            self.meta_frame_index,
                            i as u32 * 2,
                            &frame.data,
                        );
                        state.has_sent_color = true;
                        missing_color -= 1;
                        found_frame = true;
                    }

                    let state = &mut self.feeds[i];
                    if !state.has_sent_depth && state.feed.depth.lock_new() {
                        let frame = state.feed.depth.locked();
                        log::trace!(
                            "meta {} camera {} depth #{} t={:.3}",
                            self.meta_frame_index,
                            i,
                            frame.index,
                            frame.timestamp
                        );
                        fan_out(
                            &self.clients,
                            &self.shutdown,
                            self.meta_frame_index,
                            i as u32 * 2 + 1,
                            &frame.data,
                        );
                        state.has_sent_depth = true;
                        missing_depth -= 1;
                        found_frame = true;
                    }
                }

                if !found_frame {
                    // No camera had an unsent frame; sleep until one commits.
                    self.signal.wait(generation, Duration::from_millis(100));
                    if self.shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                }
            }

            // Meta-frame complete: advance and rearm every camera.
            self.meta_frame_index += 1;
            for state in &mut self.feeds {
                state.has_sent_color = false;
                state.has_sent_depth = false;
            }
            missing_color = num_cameras;
            missing_depth = num_cameras;
        }
    }
}

/// Send one frame to every connected client, dropping clients that request
/// disconnect or whose socket errors. Holds the client-list lock for the
/// whole fan-out so the acceptor cannot interleave a snapshot mid-stream.
fn fan_out(
    clients: &ClientList,
    shutdown: &AtomicBool,
    meta_frame_index: u32,
    frame_id: u32,
    blob: &[u8],
) {
    let mut list = clients.lock();
    list.retain_mut(|client| {
        if shutdown.load(Ordering::Relaxed) {
            return true;
        }
        if client.wants_disconnect() {
            log::info!("Disconnecting client {}", client.peer());
            return false;
        }
        match client.send_frame(meta_frame_index, frame_id, blob) {
            Ok(()) => true,
            Err(e) => {
                log::info!("Disconnecting client {} after write error: {}", client.peer(), e);
                false
            }
        }
    });
}

/// A running broadcaster thread.
pub struct BroadcasterHandle {
    shutdown: Arc<AtomicBool>,
    signal: Arc<FrameSignal>,
    thread: Option<JoinHandle<()>>,
}

impl BroadcasterHandle {
    pub fn spawn(mut broadcaster: Broadcaster) -> Result<Self> {
        let shutdown = Arc::clone(&broadcaster.shutdown);
        let signal = Arc::clone(&broadcaster.signal);
        let thread = thread::Builder::new()
            .name("broadcaster".to_string())
            .spawn(move || {
                broadcaster.run();
                log::debug!("Broadcaster thread exiting");
            })?;
        Ok(Self {
            shutdown,
            signal,
            thread: Some(thread),
        })
    }

    /// Signal cancellation and join.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.signal.notify();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::error!("Broadcaster thread panicked during shutdown");
        }
    }
}

impl Drop for BroadcasterHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.signal.notify();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
