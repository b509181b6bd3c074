//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! listen_port = 26000
//! cameras = ["front", "side"]
//!
//! [device]
//! source = "mock"
//!
//! [device.simulation]
//! serials = ["A0001", "A0002"]
//! frame_rate_hz = 30
//!
//! [cameras.front]
//! serial_number = "A0001"
//! remove_background = true
//! background_file = "front.bg"
//! capture_background_frames = 0
//! max_depth = 0
//! background_fuzz = 5
//! compress_depth = true
//!
//! [cameras.side]
//! serial_number = "A0002"
//! ```
//!
//! Camera sections are looked up by the names listed in `server.cameras`;
//! a listed name without a matching `[cameras.<name>]` section is a
//! configuration error. A configured serial number that is not present on
//! the bus is NOT an error: the camera is logged and skipped at startup.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_listen_port() -> u16 {
    26000
}

fn default_frame_rate() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

/// TCP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Port the acceptor listens on.
    ///
    /// **Default**: 26000. Port 0 binds an ephemeral port (useful in tests).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Names of the camera sections to serve, in wire order.
    #[serde(default)]
    pub cameras: Vec<String>,
}

/// Device backend selection.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// **Valid values**: "mock" (the shipped simulated bus). Hardware hubs
    /// implement [`crate::devices::DeviceHub`] and plug in at this seam.
    pub source: String,

    /// Simulated-bus parameters; required when `source = "mock"`.
    #[serde(default)]
    pub simulation: Option<SimulationConfig>,
}

/// Parameters of the simulated bus.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    /// Serial numbers present on the simulated bus. May differ from the
    /// configured cameras; unmatched cameras are skipped like on real
    /// hardware.
    pub serials: Vec<String>,

    /// Synthetic scene frame rate.
    #[serde(default = "default_frame_rate")]
    pub frame_rate_hz: u32,
}

/// Per-camera configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Serial number to look for on the bus. **Required**.
    pub serial_number: String,

    /// Enable background removal for this camera's depth stream.
    ///
    /// **Default**: true
    #[serde(default = "default_true")]
    pub remove_background: bool,

    /// Previously saved background image to load at startup.
    #[serde(default)]
    pub background_file: Option<String>,

    /// Number of depth frames to capture into the background at startup.
    ///
    /// **Default**: 0 (no capture)
    #[serde(default)]
    pub capture_background_frames: u32,

    /// Depth value at or beyond which pixels are treated as background.
    ///
    /// **Default**: 0 (unset)
    #[serde(default)]
    pub max_depth: u16,

    /// Background removal fuzz bias; positive removes more aggressively.
    ///
    /// **Default**: keep the session default.
    #[serde(default)]
    pub background_fuzz: Option<i32>,

    /// Request run-length + differential compressed depth on the wire.
    ///
    /// **Default**: true
    #[serde(default = "default_true")]
    pub compress_depth: bool,
}

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub device: DeviceConfig,
    #[serde(default)]
    pub cameras: HashMap<String, CameraConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Validation
    ///
    /// - every name in `server.cameras` must have a `[cameras.<name>]`
    ///   section
    /// - `source = "mock"` requires the `[device.simulation]` section
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = basic_toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        for name in &config.server.cameras {
            if !config.cameras.contains_key(name) {
                return Err(Error::Config(format!(
                    "camera \"{}\" listed in server.cameras has no [cameras.{}] section",
                    name, name
                )));
            }
        }

        match config.device.source.as_str() {
            "mock" => {
                if config.device.simulation.is_none() {
                    return Err(Error::Config(
                        "mock device source requires [device.simulation] section".to_string(),
                    ));
                }
            }
            other => {
                return Err(Error::Config(format!("Unknown device source: {}", other)));
            }
        }

        Ok(config)
    }

    /// The configured camera sections in wire order.
    pub fn camera_sections(&self) -> impl Iterator<Item = (&str, &CameraConfig)> {
        self.server
            .cameras
            .iter()
            .filter_map(|name| self.cameras.get(name).map(|c| (name.as_str(), c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [server]
        listen_port = 27000
        cameras = ["front", "side"]

        [device]
        source = "mock"

        [device.simulation]
        serials = ["A1", "A2"]

        [cameras.front]
        serial_number = "A1"
        background_file = "front.bg"
        capture_background_frames = 10
        max_depth = 1000
        background_fuzz = 5

        [cameras.side]
        serial_number = "A2"
        remove_background = false
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(FULL).unwrap();
        assert_eq!(config.server.listen_port, 27000);

        let sections: Vec<_> = config.camera_sections().collect();
        assert_eq!(sections.len(), 2);

        let (name, front) = sections[0];
        assert_eq!(name, "front");
        assert_eq!(front.serial_number, "A1");
        assert!(front.remove_background);
        assert_eq!(front.capture_background_frames, 10);
        assert_eq!(front.max_depth, 1000);
        assert_eq!(front.background_fuzz, Some(5));
        assert!(front.compress_depth);

        let (_, side) = sections[1];
        assert!(!side.remove_background);
        assert_eq!(side.background_fuzz, None);
        assert_eq!(side.capture_background_frames, 0);
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse(
            r#"
            [server]
            [device]
            source = "mock"
            [device.simulation]
            serials = []
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen_port, 26000);
        assert!(config.server.cameras.is_empty());
        assert_eq!(config.device.simulation.unwrap().frame_rate_hz, 30);
    }

    #[test]
    fn test_missing_camera_section_rejected() {
        let err = Config::parse(
            r#"
            [server]
            cameras = ["ghost"]
            [device]
            source = "mock"
            [device.simulation]
            serials = []
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_missing_serial_number_rejected() {
        assert!(
            Config::parse(
                r#"
                [server]
                cameras = ["front"]
                [device]
                source = "mock"
                [device.simulation]
                serials = []
                [cameras.front]
                remove_background = true
                "#,
            )
            .is_err()
        );
    }

    #[test]
    fn test_unknown_device_source_rejected() {
        assert!(
            Config::parse(
                r#"
                [server]
                [device]
                source = "quantum"
                "#,
            )
            .is_err()
        );
    }
}
