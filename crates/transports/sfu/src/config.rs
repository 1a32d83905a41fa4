//! Configuration types for the SFU signaling server and client

use crate::engine::{MediaCodec, MediaKind, WebRtcTransportOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the SFU signaling server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Signaling listen address (default: 0.0.0.0:3001)
    pub listen_address: String,

    /// IP the media transports listen on (default: 0.0.0.0)
    pub rtc_listen_ip: String,

    /// Public IP announced in ICE candidates (None = use listen IP)
    pub rtc_announced_ip: Option<String>,

    /// Lowest RTC port handed to the engine worker (default: 10000)
    pub rtc_min_port: u16,

    /// Highest RTC port handed to the engine worker (default: 10100)
    pub rtc_max_port: u16,

    /// Enable UDP ICE candidates (default: true)
    pub enable_udp: bool,

    /// Enable TCP ICE candidates (default: true)
    pub enable_tcp: bool,

    /// Prefer UDP over TCP (default: true)
    pub prefer_udp: bool,

    /// Router media codecs (default: VP8 + Opus)
    pub media_codecs: Vec<MediaCodec>,

    /// Timeout envelope applied to every signaling request (default: 10000ms)
    pub request_timeout_ms: u64,

    /// Delay between engine death and process exit (default: 2000ms)
    pub engine_death_grace_ms: u64,

    /// Maximum concurrent signaling connections (0 = unlimited)
    pub max_connections: u32,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:3001".to_string(),
            rtc_listen_ip: "0.0.0.0".to_string(),
            rtc_announced_ip: None,
            rtc_min_port: 10000,
            rtc_max_port: 10100,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            media_codecs: default_media_codecs(),
            request_timeout_ms: 10_000,
            engine_death_grace_ms: 2_000,
            max_connections: 0,
        }
    }
}

/// VP8 video at 90kHz and stereo Opus audio at 48kHz
pub fn default_media_codecs() -> Vec<MediaCodec> {
    vec![
        MediaCodec {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
        },
        MediaCodec {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
        },
    ]
}

impl SfuConfig {
    /// Load configuration from a TOML file; missing keys take their defaults
    pub fn from_toml_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text).map_err(|e| match e {
            crate::Error::InvalidConfig(msg) => {
                crate::Error::InvalidConfig(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        toml::from_str(text).map_err(|e| crate::Error::InvalidConfig(e.to_string()))
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `listen_address` is not a socket address
    /// - `rtc_min_port` is greater than `rtc_max_port`
    /// - `media_codecs` is empty or a codec mime type does not match its kind
    /// - `request_timeout_ms` is 0
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::InvalidConfig(format!(
                "listen_address must be a socket address, got {}",
                self.listen_address
            )));
        }

        if self.rtc_min_port == 0 || self.rtc_min_port > self.rtc_max_port {
            return Err(Error::InvalidConfig(format!(
                "rtc port range is invalid: {}-{}",
                self.rtc_min_port, self.rtc_max_port
            )));
        }

        if !self.enable_udp && !self.enable_tcp {
            return Err(Error::InvalidConfig(
                "at least one of enable_udp/enable_tcp is required".to_string(),
            ));
        }

        if self.media_codecs.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one media codec is required".to_string(),
            ));
        }

        for codec in &self.media_codecs {
            let prefix = format!("{}/", codec.kind.as_str());
            if !codec.mime_type.to_ascii_lowercase().starts_with(&prefix) {
                return Err(Error::InvalidConfig(format!(
                    "codec {} does not match kind {}",
                    codec.mime_type,
                    codec.kind.as_str()
                )));
            }
        }

        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Timeout envelope for one signaling request
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Grace period between engine death and process exit
    pub fn engine_death_grace(&self) -> Duration {
        Duration::from_millis(self.engine_death_grace_ms)
    }

    /// Options passed to the router for every new transport
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.rtc_listen_ip.clone(),
            announced_ip: self.rtc_announced_ip.clone(),
            enable_udp: self.enable_udp,
            enable_tcp: self.enable_tcp,
            prefer_udp: self.prefer_udp,
        }
    }

    /// Preset for local development and tests: loopback only, short timeouts
    pub fn local_preset() -> Self {
        Self {
            listen_address: "127.0.0.1:0".to_string(),
            rtc_listen_ip: "127.0.0.1".to_string(),
            request_timeout_ms: 5_000,
            engine_death_grace_ms: 0,
            ..Default::default()
        }
    }

    /// Set the signaling listen address
    pub fn with_listen_address(mut self, address: &str) -> Self {
        self.listen_address = address.to_string();
        self
    }

    /// Set the announced IP for ICE candidates
    pub fn with_announced_ip(mut self, ip: &str) -> Self {
        self.rtc_announced_ip = Some(ip.to_string());
        self
    }

    /// Set the per-request timeout
    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }
}

/// Configuration for the client session orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Signaling server URL (ws:// or wss://)
    pub server_url: String,

    /// Timeout for one signaling call (default: 10000ms)
    pub request_timeout_ms: u64,

    /// Room the producer publishes into and the consumer lists
    pub room_id: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:3001".to_string(),
            request_timeout_ms: 10_000,
            room_id: "1".to_string(),
        }
    }
}

impl ClientConfig {
    /// Create a client configuration for a server URL
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
            ..Default::default()
        }
    }

    /// Set the room id
    pub fn with_room(mut self, room_id: &str) -> Self {
        self.room_id = room_id.to_string();
        self
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> crate::Result<()> {
        if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            return Err(crate::Error::InvalidConfig(format!(
                "server_url must start with ws:// or wss://, got {}",
                self.server_url
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Timeout for one signaling call
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SfuConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.media_codecs.len(), 2);
    }

    #[test]
    fn test_invalid_port_range_fails() {
        let mut config = SfuConfig::default();
        config.rtc_min_port = 20000;
        config.rtc_max_port = 10000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_listen_address_fails() {
        let config = SfuConfig::default().with_listen_address("localhost");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_codec_kind_mismatch_fails() {
        let mut config = SfuConfig::default();
        config.media_codecs[0].mime_type = "audio/VP8".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_fails() {
        let config = SfuConfig::default().with_request_timeout_ms(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SfuConfig::from_toml_str(
            r#"
            listen_address = "127.0.0.1:4000"
            rtc_announced_ip = "203.0.113.7"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_address, "127.0.0.1:4000");
        assert_eq!(config.rtc_announced_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(config.rtc_min_port, 10000);
        assert_eq!(config.request_timeout_ms, 10_000);
    }

    #[test]
    fn test_toml_file_round_trip() {
        let config = SfuConfig::default().with_announced_ip("198.51.100.1");
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), toml::to_string(&config).unwrap()).unwrap();

        let loaded = SfuConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(loaded.rtc_announced_ip.as_deref(), Some("198.51.100.1"));
        assert_eq!(loaded.media_codecs, config.media_codecs);
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let result = SfuConfig::from_toml_str("listen_address = [");
        assert!(matches!(result, Err(crate::Error::InvalidConfig(_))));
    }

    #[test]
    fn test_client_config_validation() {
        assert!(ClientConfig::default().validate().is_ok());
        assert!(ClientConfig::new("http://localhost:3001").validate().is_err());
        assert_eq!(ClientConfig::default().with_room("lobby").room_id, "lobby");
    }
}
