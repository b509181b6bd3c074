//! Error types for depthcast
//!
//! # Error Recovery Strategies
//!
//! ## Fatal at Startup
//!
//! - **`Config`**: The configuration file is missing a section or holds an
//!   unparseable value. Fix the configuration and restart; the supervisor
//!   aborts before any camera is opened.
//!
//! ## Logged and Skipped
//!
//! - **`DeviceNotFound`**: A configured serial number is not present on the
//!   bus. The camera is skipped; the server starts with the cameras that
//!   were found.
//!
//! ## Transient (Retry)
//!
//! - **`DeviceIo`**: An isochronous transfer failed. The transfer is
//!   resubmitted by the stream backend; the pump logs and keeps reading.
//! - **`Io`**: Generic I/O error. On a client socket this drops that client
//!   only; on a background file it surfaces to the caller.
//!
//! ## Fatal to One Session
//!
//! - **`DeviceGone`**: The device disappeared from the bus. The stream shuts
//!   down and no further frame callbacks run; other cameras are unaffected.
//!
//! ## Protocol (Log and Continue)
//!
//! - **`Codec`**: A compressor rejected a frame (shape mismatch, truncated
//!   compressed data). The frame is dropped; the stream remains usable.
//!
//! Non-intact raw frames are NOT errors: the decoders are lossy-tolerant
//! and deliver them anyway.

use thiserror::Error;

/// Errors that can occur in depthcast
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Camera with serial number {0} not found on bus")]
    DeviceNotFound(String),

    #[error("Device I/O error: {0}")]
    DeviceIo(String),

    #[error("Device disconnected")]
    DeviceGone,

    #[error("Codec error: {0}")]
    Codec(String),
}

pub type Result<T> = std::result::Result<T, Error>;
