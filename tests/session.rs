//! Device session tests over the simulated sensor: delivery, lossy-frame
//! tolerance, background capture and removal, and stop semantics.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use depthcast::devices::mock::MockSensor;
use depthcast::devices::session::CameraSession;
use depthcast::devices::{FrameRate, FrameSize, SensorMode};
use depthcast::types::{FrameBuffer, FrameKind, INVALID_DEPTH, Pixels};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn vga_mode(compress_depth: bool) -> SensorMode {
    SensorMode {
        color_size: FrameSize::Vga,
        color_rate: FrameRate::Fps30,
        depth_size: FrameSize::Vga,
        depth_rate: FrameRate::Fps30,
        compress_depth,
    }
}

fn start_session(
    compress_depth: bool,
) -> (
    CameraSession,
    depthcast::devices::mock::MockFeed,
    mpsc::Receiver<Arc<FrameBuffer>>,
    mpsc::Receiver<Arc<FrameBuffer>>,
) {
    let (sensor, feed) = MockSensor::new("S1");
    let mut session = CameraSession::new(Box::new(sensor));
    session.configure(vga_mode(compress_depth));

    let (color_tx, color_rx) = mpsc::channel();
    let (depth_tx, depth_rx) = mpsc::channel();
    session
        .start(
            Box::new(move |frame| {
                let _ = color_tx.send(frame);
            }),
            Box::new(move |frame| {
                let _ = depth_tx.send(frame);
            }),
        )
        .unwrap();
    (session, feed, color_rx, depth_rx)
}

#[test]
fn test_decoded_frames_reach_callbacks() {
    let (mut session, feed, color_rx, depth_rx) = start_session(true);

    feed.push_color(vec![128u8; 640 * 480]);
    feed.push_depth(&vec![700u16; 640 * 480]);

    let color = color_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(color.kind, FrameKind::Color);
    assert_eq!((color.width, color.height), (640, 480));
    let Pixels::Rgb(rgb) = &color.pixels else {
        panic!("color frame without RGB pixels");
    };
    assert_eq!(rgb.len(), 640 * 480 * 3);
    // Uniform mosaic demosaics to uniform gray.
    assert!(rgb.iter().all(|&v| v == 128));

    let depth = depth_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(depth.kind, FrameKind::Depth);
    assert_eq!(depth.depth_samples().unwrap(), vec![700u16; 640 * 480].as_slice());

    session.stop();
}

#[test]
fn test_uncompressed_depth_mode() {
    let (mut session, feed, _color_rx, depth_rx) = start_session(false);

    let samples: Vec<u16> = (0..640 * 480u32).map(|i| (i % 0x07ff) as u16).collect();
    feed.push_depth(&samples);

    let depth = depth_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(depth.depth_samples().unwrap(), samples.as_slice());

    session.stop();
}

#[test]
fn test_timestamps_monotonic() {
    let (mut session, feed, color_rx, _depth_rx) = start_session(true);

    let mut last = -1.0f64;
    for shade in 0..3u8 {
        feed.push_color(vec![shade; 640 * 480]);
        let frame = color_rx.recv_timeout(RECV_TIMEOUT).unwrap();
        assert!(frame.timestamp > last);
        last = frame.timestamp;
    }

    session.stop();
}

/// A frame that lost a packet in transit is decoded and delivered anyway.
#[test]
fn test_lossy_frame_still_delivered() {
    let (mut session, feed, color_rx, _depth_rx) = start_session(true);

    feed.push_color_lossy(vec![50u8; 640 * 480]);
    let frame = color_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!((frame.width, frame.height), (640, 480));

    // The stream recovers on the next intact frame.
    feed.push_color(vec![60u8; 640 * 480]);
    let frame = color_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    let Pixels::Rgb(rgb) = &frame.pixels else {
        panic!("color frame without RGB pixels");
    };
    assert!(rgb.iter().all(|&v| v == 60));

    session.stop();
}

/// Background capture over streamed frames, then removal with fuzz: near
/// pixels survive, background pixels become the invalid-depth sentinel.
#[test]
fn test_background_capture_and_removal() {
    let (mut session, feed, _color_rx, depth_rx) = start_session(true);

    let n = 640 * 480usize;
    session.set_background_removal_fuzz(2);
    session.capture_background(2, true, None);

    // Two capture frames; the background becomes their pointwise minimum.
    for depth in [1000u16, 900] {
        feed.push_depth(&vec![depth; n]);
        depth_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    }

    session.set_remove_background(true);
    assert!(session.remove_background());

    let mut scene = vec![500u16; n];
    scene[0] = 897; // just out of fuzz reach of the 900 background
    scene[1] = 899;
    feed.push_depth(&scene);

    let filtered = depth_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    let samples = filtered.depth_samples().unwrap();
    assert_eq!(samples[0], 897); // 897 + 2 < 900: kept
    assert_eq!(samples[1], INVALID_DEPTH); // 899 + 2 >= 900: removed
    assert_eq!(samples[2], 500);

    session.stop();
}

/// Capture with replace=false folds new minima into a loaded background.
#[test]
fn test_capture_preserves_prior_background_minimum() {
    let (mut session, feed, _color_rx, depth_rx) = start_session(true);
    let n = 640 * 480usize;

    // Prior background: flat at 800.
    let mut prior = Vec::new();
    prior.extend_from_slice(&640u32.to_le_bytes());
    prior.extend_from_slice(&480u32.to_le_bytes());
    for _ in 0..n {
        prior.extend_from_slice(&800u16.to_le_bytes());
    }
    session.load_background(&mut prior.as_slice()).unwrap();

    // Captured frames sit at 900: farther than the prior background.
    session.capture_background(2, false, None);
    for _ in 0..2 {
        feed.push_depth(&vec![900u16; n]);
        depth_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    }

    // The pointwise minimum with the prior background must win.
    let mut saved = Vec::new();
    session.save_background(&mut saved).unwrap();
    let first_pixel = u16::from_le_bytes([saved[8], saved[9]]);
    assert_eq!(first_pixel, 800);

    session.stop();
}

/// A captured background survives a save/load cycle through a real file.
#[test]
fn test_background_file_roundtrip() {
    let n = 640 * 480usize;
    let (mut session, feed, _color_rx, depth_rx) = start_session(true);
    session.capture_background(1, true, None);
    feed.push_depth(&vec![750u16; n]);
    depth_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    session.save_background(file.as_file_mut()).unwrap();
    session.stop();

    let (sensor, feed2) = MockSensor::new("S2");
    let mut restored = CameraSession::new(Box::new(sensor));
    restored.configure(vga_mode(true));
    let mut reopened = std::fs::File::open(file.path()).unwrap();
    restored.load_background(&mut reopened).unwrap();
    restored.set_remove_background(true);

    let (depth_tx2, depth_rx2) = mpsc::channel();
    restored
        .start(
            Box::new(|_| {}),
            Box::new(move |frame| {
                let _ = depth_tx2.send(frame);
            }),
        )
        .unwrap();

    feed2.push_depth(&vec![800u16; n]);
    let filtered = depth_rx2.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(
        filtered
            .depth_samples()
            .unwrap()
            .iter()
            .all(|&v| v == INVALID_DEPTH)
    );
    restored.stop();
}

/// Capture completion fires the done callback from the decoding path.
#[test]
fn test_capture_completion_callback() {
    let (mut session, feed, _color_rx, depth_rx) = start_session(true);
    let (done_tx, done_rx) = mpsc::channel();

    session.capture_background(
        3,
        true,
        Some(Box::new(move || {
            let _ = done_tx.send(());
        })),
    );

    for _ in 0..3 {
        feed.push_depth(&vec![600u16; 640 * 480]);
        depth_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    }
    done_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    session.stop();
}

/// After stop returns, no transfers are active and no callback ever runs
/// again.
#[test]
fn test_stop_quiesces_session() {
    let (mut session, feed, color_rx, depth_rx) = start_session(true);

    feed.push_color(vec![10u8; 640 * 480]);
    feed.push_depth(&vec![500u16; 640 * 480]);
    color_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    depth_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    session.stop();
    assert_eq!(session.active_transfers(), 0);

    // Frames queued after stop never surface.
    feed.push_color(vec![20u8; 640 * 480]);
    feed.push_depth(&vec![400u16; 640 * 480]);
    assert!(color_rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(depth_rx.recv_timeout(Duration::from_millis(300)).is_err());
}

/// A vanished device shuts its streams down without wedging stop.
#[test]
fn test_unplug_terminates_stream() {
    let (mut session, feed, color_rx, _depth_rx) = start_session(true);

    feed.push_color(vec![10u8; 640 * 480]);
    color_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    feed.unplug();
    std::thread::sleep(Duration::from_millis(100));

    // The stream is dead: nothing more is delivered.
    feed.push_color(vec![30u8; 640 * 480]);
    assert!(color_rx.recv_timeout(Duration::from_millis(300)).is_err());

    session.stop();
    assert_eq!(session.active_transfers(), 0);
}
