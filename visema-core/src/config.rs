// Configuration for the render service
//
// Layering: defaults -> optional config file (TOML or JSON) -> environment.
// Command line flags are applied last by the server binary.

use crate::geometry::{FrameGeometry, MAX_FPS, MAX_HEIGHT, MAX_WIDTH, MIN_FPS, MIN_HEIGHT, MIN_WIDTH};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the draw loop does when a slow consumer forces frames to be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Drop without telling anyone (the consumer just sees a lower frame rate)
    Silent,
    /// Drop and log a warning every `drop_report_every` dropped frames
    Report,
}

/// Where avatar images are fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetBackend {
    /// No asset store: every session renders the placeholder background
    None,
    /// Files below a root directory, keyed by relative path
    Directory { path: String },
    /// `GET <base_url>/<key>` (object storage endpoint or CDN)
    Http { base_url: String },
}

/// Peer connection backend for the WebRTC transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebRtcBackend {
    Disabled,
    /// In-process peer, useful for local testing of the signalling path
    Loopback,
    /// Real peer connection (requires the `webrtc` feature of visema-server)
    Native,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub bind_address: String,
    pub port: u16,

    /// Defaults applied when a render request omits width/height/fps
    pub default_width: u32,
    pub default_height: u32,
    pub default_fps: u32,

    /// JPEG quality for the multipart transport (1-100)
    pub jpeg_quality: u8,

    /// Sessions without an attached transport are reaped after this long
    pub session_ttl_secs: u64,
    pub reaper_interval_secs: u64,

    /// Encoded frames buffered per multipart stream before dropping
    pub stream_buffer_frames: usize,

    pub drop_policy: DropPolicy,
    pub drop_report_every: u64,

    /// Decoded avatars kept in memory, keyed by (reference, width, height)
    pub avatar_cache_size: usize,

    /// Largest avatar object accepted from the asset store, in bytes
    pub max_avatar_bytes: usize,

    pub assets: AssetBackend,
    pub webrtc: WebRtcBackend,

    /// STUN servers handed to the native WebRTC backend
    pub ice_servers: Vec<String>,

    pub log_level: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        let frame = FrameGeometry::default();
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            default_width: frame.width,
            default_height: frame.height,
            default_fps: frame.fps,
            jpeg_quality: 85,
            session_ttl_secs: 60,
            reaper_interval_secs: 5,
            stream_buffer_frames: 1,
            drop_policy: DropPolicy::Silent,
            drop_report_every: 30,
            avatar_cache_size: 32,
            max_avatar_bytes: 16 * 1024 * 1024,
            assets: AssetBackend::None,
            webrtc: WebRtcBackend::Disabled,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            log_level: "info".to_string(),
        }
    }
}

impl RenderConfig {
    /// Load configuration from a TOML or JSON file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a string (JSON first, then TOML)
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        if let Ok(config) = serde_json::from_str::<RenderConfig>(content) {
            return Ok(config);
        }

        toml::from_str::<RenderConfig>(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_vars(std::env::vars());
    }

    /// Apply overrides from `(name, value)` pairs.
    ///
    /// Recognises the `VISEMA_*` names plus the bare `PORT`, `WIDTH`, `HEIGHT`,
    /// `FPS`, `ASSETS_DIR` and `ASSETS_URL` used by container deployments.
    /// Unparseable values are ignored.
    pub fn apply_env_vars<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let value: String = value.into();
            match key.as_ref() {
                "VISEMA_BIND_ADDRESS" => self.bind_address = value,
                "VISEMA_PORT" | "PORT" => set_parsed(&mut self.port, &value),
                "VISEMA_WIDTH" | "WIDTH" => set_parsed(&mut self.default_width, &value),
                "VISEMA_HEIGHT" | "HEIGHT" => set_parsed(&mut self.default_height, &value),
                "VISEMA_FPS" | "FPS" => set_parsed(&mut self.default_fps, &value),
                "VISEMA_JPEG_QUALITY" => set_parsed(&mut self.jpeg_quality, &value),
                "VISEMA_SESSION_TTL_SECS" => set_parsed(&mut self.session_ttl_secs, &value),
                "VISEMA_ASSETS_DIR" | "ASSETS_DIR" => {
                    self.assets = AssetBackend::Directory { path: value }
                }
                "VISEMA_ASSETS_URL" | "ASSETS_URL" => {
                    self.assets = AssetBackend::Http { base_url: value }
                }
                "VISEMA_WEBRTC" => match value.as_str() {
                    "disabled" => self.webrtc = WebRtcBackend::Disabled,
                    "loopback" => self.webrtc = WebRtcBackend::Loopback,
                    "native" => self.webrtc = WebRtcBackend::Native,
                    _ => {}
                },
                "VISEMA_DROP_POLICY" => match value.as_str() {
                    "silent" => self.drop_policy = DropPolicy::Silent,
                    "report" => self.drop_policy = DropPolicy::Report,
                    _ => {}
                },
                "VISEMA_LOG_LEVEL" => self.log_level = value,
                _ => {}
            }
        }
    }

    /// Defaults for a render request that omits its frame parameters
    pub fn default_geometry(&self) -> FrameGeometry {
        FrameGeometry {
            width: self.default_width,
            height: self.default_height,
            fps: self.default_fps,
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ValidationError(
                "port cannot be 0".to_string(),
            ));
        }

        if !(MIN_WIDTH..=MAX_WIDTH).contains(&self.default_width) {
            return Err(ConfigError::ValidationError(format!(
                "default_width must be between {} and {}",
                MIN_WIDTH, MAX_WIDTH
            )));
        }
        if !(MIN_HEIGHT..=MAX_HEIGHT).contains(&self.default_height) {
            return Err(ConfigError::ValidationError(format!(
                "default_height must be between {} and {}",
                MIN_HEIGHT, MAX_HEIGHT
            )));
        }
        if !(MIN_FPS..=MAX_FPS).contains(&self.default_fps) {
            return Err(ConfigError::ValidationError(format!(
                "default_fps must be between {} and {}",
                MIN_FPS, MAX_FPS
            )));
        }

        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::ValidationError(
                "jpeg_quality must be between 1 and 100".to_string(),
            ));
        }

        if self.stream_buffer_frames == 0 {
            return Err(ConfigError::ValidationError(
                "stream_buffer_frames must be > 0".to_string(),
            ));
        }

        if self.session_ttl_secs == 0 || self.reaper_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "session_ttl_secs and reaper_interval_secs must be > 0".to_string(),
            ));
        }

        if self.drop_policy == DropPolicy::Report && self.drop_report_every == 0 {
            return Err(ConfigError::ValidationError(
                "drop_report_every must be > 0 when drop_policy is report".to_string(),
            ));
        }

        match &self.assets {
            AssetBackend::Directory { path } if path.is_empty() => {
                return Err(ConfigError::ValidationError(
                    "assets.path cannot be empty".to_string(),
                ));
            }
            AssetBackend::Http { base_url }
                if !(base_url.starts_with("http://") || base_url.starts_with("https://")) =>
            {
                return Err(ConfigError::ValidationError(
                    "assets.base_url must be an http(s) URL".to_string(),
                ));
            }
            _ => {}
        }

        Ok(())
    }
}

fn set_parsed<T: std::str::FromStr>(target: &mut T, value: &str) {
    if let Ok(parsed) = value.trim().parse() {
        *target = parsed;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Parse error: {}", e),
            ConfigError::ValidationError(e) => write!(f, "Validation error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RenderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_geometry(), FrameGeometry::default());
    }

    #[test]
    fn test_parse_toml() {
        let config = RenderConfig::from_str(
            r#"
            port = 9000
            default_fps = 24
            drop_policy = "report"

            [assets]
            kind = "directory"
            path = "/srv/avatars"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.default_fps, 24);
        assert_eq!(config.drop_policy, DropPolicy::Report);
        assert_eq!(
            config.assets,
            AssetBackend::Directory {
                path: "/srv/avatars".to_string()
            }
        );
        // untouched fields keep their defaults
        assert_eq!(config.jpeg_quality, 85);
    }

    #[test]
    fn test_parse_json() {
        let config = RenderConfig::from_str(r#"{"port": 7000, "webrtc": "loopback"}"#).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.webrtc, WebRtcBackend::Loopback);
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(matches!(
            RenderConfig::from_str("port = [nope"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RenderConfig::default();
        config.apply_env_vars([
            ("PORT", "3000"),
            ("FPS", "12"),
            ("WIDTH", "not-a-number"),
            ("ASSETS_URL", "https://cdn.example.com/avatars"),
            ("VISEMA_WEBRTC", "loopback"),
            ("UNRELATED", "x"),
        ]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.default_fps, 12);
        assert_eq!(config.default_width, 512);
        assert_eq!(
            config.assets,
            AssetBackend::Http {
                base_url: "https://cdn.example.com/avatars".to_string()
            }
        );
        assert_eq!(config.webrtc, WebRtcBackend::Loopback);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RenderConfig::default();
        config.jpeg_quality = 0;
        assert!(config.validate().is_err());

        let mut config = RenderConfig::default();
        config.default_fps = 60;
        assert!(config.validate().is_err());

        let mut config = RenderConfig::default();
        config.assets = AssetBackend::Http {
            base_url: "ftp://example.com".to_string(),
        };
        assert!(config.validate().is_err());
    }
}
