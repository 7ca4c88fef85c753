use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ports: PortRangeConfig,
    pub media: MediaConfig,
    pub encoder: EncoderConfig,
    pub endpoint: EndpointConfig,
    pub pipeline: PipelineConfig,
    pub room: RoomConfig,
    pub logging: LoggingConfig,
    pub alert: AlertConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path the coordinator connects its control WebSocket to
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9999,
            path: "/room".to_string(),
        }
    }
}

/// RTP port pool bounds, `[start, end)`. Every session takes two ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRangeConfig {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            start: 10000,
            end: 20000,
        }
    }
}

impl PortRangeConfig {
    /// Number of RTP/RTCP pairs that fit in the range
    #[must_use]
    pub const fn capacity(&self) -> usize {
        if self.end <= self.start {
            0
        } else {
            ((self.end - self.start) / 2) as usize
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// IP the RTP sockets bind to and that is advertised to peers
    pub local_ip: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Read frames from an out-of-process producer over a Unix socket
    pub use_unix_socket: bool,
    /// `{room}` is replaced with the room id
    pub socket_path_template: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            local_ip: "127.0.0.1".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            use_unix_socket: false,
            socket_path_template: "/tmp/mediarelay-{room}.sock".to_string(),
        }
    }
}

impl MediaConfig {
    #[must_use]
    pub fn socket_path(&self, room_id: &str) -> String {
        self.socket_path_template.replace("{room}", room_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub video: VideoCodecConfig,
    pub audio: AudioCodecConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoCodecConfig {
    pub codec: String,
    /// Used when the `start` request does not name one
    pub payload_type: u8,
    pub clock_rate: u32,
}

impl Default for VideoCodecConfig {
    fn default() -> Self {
        Self {
            codec: "raw".to_string(),
            payload_type: 102,
            clock_rate: 90_000,
        }
    }
}

/// An empty codec disables the audio track
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioCodecConfig {
    pub codec: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    /// Frame duration in milliseconds
    pub frame_ms: u32,
}

impl Default for AudioCodecConfig {
    fn default() -> Self {
        Self {
            codec: String::new(),
            payload_type: 101,
            clock_rate: 8000,
            frame_ms: 20,
        }
    }
}

impl AudioCodecConfig {
    #[must_use]
    pub fn enabled(&self) -> bool {
        !self.codec.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub video_queue_capacity: usize,
    pub audio_queue_capacity: usize,
    pub input_queue_capacity: usize,
    pub mtu: usize,
    /// Rolling deadline for inbound reads; expiry ends the input stream
    pub read_timeout_ms: u64,
    /// Grace delay between stopping and rebinding a live endpoint
    pub settle_delay_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            video_queue_capacity: 30,
            audio_queue_capacity: 1,
            input_queue_capacity: 100,
            mtu: 1200,
            read_timeout_ms: 20_000,
            settle_delay_ms: 2000,
        }
    }
}

impl EndpointConfig {
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input_capacity: usize,
    pub output_capacity: usize,
    /// Wait before retrying a push into a full input queue
    pub retry_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_capacity: 1,
            output_capacity: 2,
            retry_interval_ms: 5,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Maximum peers per room (0 = unlimited)
    pub max_peers: usize,
    pub input_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_peers: 0,
            input_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    /// Directory for daily rolling log files; stdout when unset
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: None,
            file_prefix: "worker.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub service_name: String,
    /// Panic reports are POSTed here when set, logged otherwise
    pub webhook_url: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            service_name: "mediarelay-worker".to_string(),
            webhook_url: None,
        }
    }
}

impl Config {
    /// Load configuration
    ///
    /// Sources, lowest priority first:
    /// 1. Built-in defaults
    /// 2. Config file (if it exists)
    /// 3. Environment variables, e.g. `MEDIARELAY_PORTS__START=30000`
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("MEDIARELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Check the configuration for values the worker cannot run with
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.ports.capacity() == 0 {
            errors.push(format!(
                "ports: range [{}, {}) holds no RTP/RTCP pair",
                self.ports.start, self.ports.end
            ));
        }
        if self.ports.start % 2 != 0 {
            errors.push(format!("ports.start {} must be even", self.ports.start));
        }
        if self.media.local_ip.parse::<IpAddr>().is_err() {
            errors.push(format!("media.local_ip: '{}' is not an IP address", self.media.local_ip));
        }
        if self.media.width == 0 || self.media.height == 0 {
            errors.push("media: frame dimensions must be non-zero".to_string());
        }
        if self.media.fps == 0 {
            errors.push("media.fps must be non-zero".to_string());
        }
        if self.pipeline.input_capacity == 0 || self.pipeline.output_capacity == 0 {
            errors.push("pipeline: queue capacities must be non-zero".to_string());
        }
        if self.endpoint.video_queue_capacity == 0
            || self.endpoint.audio_queue_capacity == 0
            || self.endpoint.input_queue_capacity == 0
        {
            errors.push("endpoint: queue capacities must be non-zero".to_string());
        }
        if self.room.input_capacity == 0 {
            errors.push("room.input_capacity must be non-zero".to_string());
        }
        if self.endpoint.mtu < 64 {
            errors.push(format!("endpoint.mtu {} is too small", self.endpoint.mtu));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
