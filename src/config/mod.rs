//! Configuration for the media routing and turn-taking server.
//!
//! Layered TOML config with validated defaults: every sub-struct implements
//! `Default` by hand, and [`Config::load`] falls back to [`Config::default`]
//! when the file is absent.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Root configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub vad: VadConfig,
    pub stopword: StopwordConfig,
    pub codec: CodecConfig,
    pub rtc: RtcConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            vad: VadConfig::default(),
            stopword: StopwordConfig::default(),
            codec: CodecConfig::default(),
            rtc: RtcConfig::default(),
            queue: QueueConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(config)
    }

    /// Validate cross-field invariants. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(limit) = self.session.concurrency_limit {
            if limit == 0 {
                return Err(ConfigError::ZeroConcurrencyLimit);
            }
        }
        if let Some(limit) = self.session.time_limit_secs {
            if limit == 0 {
                return Err(ConfigError::ZeroTimeLimit);
            }
        }
        if self.codec.output_frame_samples == 0 {
            return Err(ConfigError::ZeroFrameSamples);
        }
        if self.vad.audio_chunk_duration_secs <= 0.0 {
            return Err(ConfigError::ZeroChunkDuration);
        }
        if self.vad.audio_chunk_duration_secs > 2.0 {
            log::warn!(
                "vad.audio_chunk_duration_secs={} is unusually large; barge-in latency will suffer",
                self.vad.audio_chunk_duration_secs
            );
        }
        if self.vad.started_talking_threshold_secs > self.vad.audio_chunk_duration_secs {
            return Err(ConfigError::ThresholdExceedsChunkDuration {
                threshold: self.vad.started_talking_threshold_secs,
                chunk: self.vad.audio_chunk_duration_secs,
            });
        }
        if self.queue.output_queue_capacity == 0 {
            return Err(ConfigError::ZeroOutputQueueCapacity);
        }
        if self.queue.inbound_queue_capacity == 0 {
            return Err(ConfigError::ZeroInboundQueueCapacity);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub route_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            route_prefix: String::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

/// `modality` from the handler contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Modality {
    Audio,
    Video,
    AudioVideo,
}

impl Default for Modality {
    fn default() -> Self {
        Modality::Audio
    }
}

/// `mode` from the handler contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    SendReceive,
    Send,
    Receive,
}

impl Default for SessionMode {
    fn default() -> Self {
        SessionMode::SendReceive
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub modality: Modality,
    pub mode: SessionMode,
    /// `None` means unbounded when unset.
    pub concurrency_limit: Option<usize>,
    /// `None` means no time limit.
    pub time_limit_secs: Option<u64>,
    /// Signalling deadline (ICE gathering / peer acceptance)
    pub negotiation_timeout_secs: u64,
    /// Inbound media stall warning threshold
    pub stall_warning_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modality: Modality::default(),
            mode: SessionMode::default(),
            concurrency_limit: None,
            time_limit_secs: None,
            negotiation_timeout_secs: 5,
            stall_warning_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub audio_chunk_duration_secs: f64,
    pub started_talking_threshold_secs: f64,
    pub speech_threshold_secs: f64,
    pub min_speech_duration_ms: u32,
    pub min_silence_duration_ms: u32,
    pub model_score_threshold: f32,
    pub native_sample_rate: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            audio_chunk_duration_secs: 0.6,
            started_talking_threshold_secs: 0.2,
            speech_threshold_secs: 0.1,
            min_speech_duration_ms: 100,
            min_silence_duration_ms: 200,
            model_score_threshold: 0.5,
            native_sample_rate: 16_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StopwordConfig {
    pub stopword_window_secs: f64,
    pub stop_words: Vec<String>,
}

impl Default for StopwordConfig {
    fn default() -> Self {
        Self {
            stopword_window_secs: 5.0,
            stop_words: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

impl Default for ChannelLayout {
    fn default() -> Self {
        ChannelLayout::Mono
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub output_frame_samples: usize,
    pub channel_layout: ChannelLayout,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            output_frame_samples: 960,
            channel_layout: ChannelLayout::Mono,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub transport_policy: String,
    pub stun_host: String,
    pub stun_port: u16,
    pub turn_host: String,
    pub turn_port: u16,
    pub turn_protocol: String,
    pub turn_tls: bool,
    pub turn_username: String,
    pub turn_password: String,
    pub turn_shared_secret: String,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            transport_policy: "all".to_string(),
            stun_host: String::new(),
            stun_port: 0,
            turn_host: String::new(),
            turn_port: 3478,
            turn_protocol: "udp".to_string(),
            turn_tls: false,
            turn_username: String::new(),
            turn_password: String::new(),
            turn_shared_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub output_queue_capacity: usize,
    pub inbound_queue_capacity: usize,
    /// Re-framer/generator-to-pump buffer, in seconds of audio.
    pub reframer_buffer_secs: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            output_queue_capacity: 32,
            inbound_queue_capacity: 64,
            reframer_buffer_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_concurrency_limit() {
        let mut config = Config::default();
        config.session.concurrency_limit = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_frame_samples() {
        let mut config = Config::default();
        config.codec.output_frame_samples = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_vad_thresholds() {
        let mut config = Config::default();
        config.vad.started_talking_threshold_secs = 10.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let config = Config::load("/nonexistent/path/to/config.toml").unwrap();
        assert_eq!(config.server.port, default_port());
    }
}
