//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use petfeeder_media::{CameraConfig, ConvertConfig};
use petfeeder_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_LED_SETTLE_MS, DEFAULT_RECORDING_CUTOFF_SECS,
    DEFAULT_THUMBNAIL_COUNT, DEFAULT_THUMBNAIL_HEIGHT, DEFAULT_THUMBNAIL_WIDTH,
};
use petfeeder_store::Database;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address of the HTTP / WebSocket transport.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Holds `petfeeder.db` and the dated `media/` tree.
    /// Env: `DATA_DIR`
    /// Default: platform data dir, or `./data` if there is none.
    pub data_dir: PathBuf,

    /// Static web UI served next to the WebSocket endpoint.
    /// Env: `WEB_ROOT`
    /// Default: none.
    pub web_root: Option<PathBuf>,

    /// Time from the start of a feeding recording until it is cut.
    /// Env: `RECORDING_CUTOFF_SECS`
    pub recording_cutoff: Duration,

    /// Pause before idle LEDs are restored after the camera goes away.
    /// Env: `LED_SETTLE_MS`
    pub led_settle: Duration,

    /// Env: `THUMBNAIL_COUNT`
    pub thumbnail_count: usize,

    /// Env: `THUMBNAIL_SIZE` as `WIDTHxHEIGHT`
    pub thumbnail_size: (u32, u32),

    /// Env: `CAMERA_WIDTH`, `CAMERA_HEIGHT`, `CAMERA_FRAMERATE`, `CAMERA_BITRATE`
    pub camera: CameraConfig,

    /// Env: `FFMPEG_PATH`
    /// Default: `ffmpeg` (looked up in `PATH`).
    pub ffmpeg_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            data_dir: Database::default_data_dir().unwrap_or_else(|_| PathBuf::from("./data")),
            web_root: None,
            recording_cutoff: Duration::from_secs(DEFAULT_RECORDING_CUTOFF_SECS),
            led_settle: Duration::from_millis(DEFAULT_LED_SETTLE_MS),
            thumbnail_count: DEFAULT_THUMBNAIL_COUNT,
            thumbnail_size: (DEFAULT_THUMBNAIL_WIDTH, DEFAULT_THUMBNAIL_HEIGHT),
            camera: CameraConfig::default(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(dir) = var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(root) = var("WEB_ROOT") {
            if !root.is_empty() {
                config.web_root = Some(PathBuf::from(root));
            }
        }

        if let Some(secs) = parse_var::<u64>(&var, "RECORDING_CUTOFF_SECS") {
            config.recording_cutoff = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_var::<u64>(&var, "LED_SETTLE_MS") {
            config.led_settle = Duration::from_millis(ms);
        }

        if let Some(count) = parse_var::<usize>(&var, "THUMBNAIL_COUNT") {
            config.thumbnail_count = count;
        }

        if let Some(size) = var("THUMBNAIL_SIZE") {
            match parse_size(&size) {
                Some(parsed) => config.thumbnail_size = parsed,
                None => tracing::warn!(value = %size, "Invalid THUMBNAIL_SIZE, using default"),
            }
        }

        if let Some(width) = parse_var(&var, "CAMERA_WIDTH") {
            config.camera.video.width = width;
            config.camera.photo.width = width;
        }
        if let Some(height) = parse_var(&var, "CAMERA_HEIGHT") {
            config.camera.video.height = height;
            config.camera.photo.height = height;
        }
        if let Some(framerate) = parse_var(&var, "CAMERA_FRAMERATE") {
            config.camera.video.framerate = framerate;
        }
        if let Some(bitrate) = parse_var(&var, "CAMERA_BITRATE") {
            config.camera.video.bitrate = bitrate;
        }

        if let Some(path) = var("FFMPEG_PATH") {
            config.ffmpeg_path = PathBuf::from(path);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn convert_config(&self) -> ConvertConfig {
        ConvertConfig {
            ffmpeg: self.ffmpeg_path.clone(),
            framerate: self.camera.video.framerate,
            clip_secs: self.recording_cutoff.as_secs_f64(),
            thumbnail_count: self.thumbnail_count,
            thumbnail_width: self.thumbnail_size.0,
            thumbnail_height: self.thumbnail_size.1,
            keep_raw: false,
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid numeric setting, using default");
            None
        }
    }
}

/// Parse `WIDTHxHEIGHT`.
fn parse_size(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.trim().split_once(['x', 'X'])?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.recording_cutoff, Duration::from_secs(30));
        assert_eq!(config.led_settle, Duration::from_millis(100));
        assert_eq!(config.thumbnail_size, (320, 240));
        assert!(config.web_root.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("DATA_DIR", "/tmp/feeder"),
            ("RECORDING_CUTOFF_SECS", "5"),
            ("THUMBNAIL_SIZE", "160x120"),
            ("CAMERA_WIDTH", "1280"),
            ("FFMPEG_PATH", "/usr/local/bin/ffmpeg"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.data_dir, PathBuf::from("/tmp/feeder"));
        assert_eq!(config.recording_cutoff, Duration::from_secs(5));
        assert_eq!(config.thumbnail_size, (160, 120));
        assert_eq!(config.camera.video.width, 1280);

        let convert = config.convert_config();
        assert_eq!(convert.clip_secs, 5.0);
        assert_eq!(convert.ffmpeg, PathBuf::from("/usr/local/bin/ffmpeg"));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("HTTP_ADDR", "not an address"),
            ("LED_SETTLE_MS", "soon"),
            ("THUMBNAIL_SIZE", "big"),
        ]);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.led_settle, Duration::from_millis(100));
        assert_eq!(config.thumbnail_size, (320, 240));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("640x480"), Some((640, 480)));
        assert_eq!(parse_size("640X480"), Some((640, 480)));
        assert_eq!(parse_size("640"), None);
    }
}
