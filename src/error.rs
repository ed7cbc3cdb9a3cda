//! Crate-wide error types.
//!
//! Each fallible subsystem owns a `thiserror`-derived enum; [`ServerError`]
//! unifies them at crate boundaries (HTTP handlers, the session manager).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),
    #[error("channel count {actual} does not match declared layout {expected:?}")]
    ChannelMismatch {
        expected: crate::config::ChannelLayout,
        actual: u16,
    },
    #[error("resampler initialization failed: {0}")]
    ResamplerInit(String),
}

#[derive(Debug, Error)]
pub enum VadError {
    #[error("vad model scoring failed: {0}")]
    ModelFailure(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("concurrency limit reached ({limit} active sessions)")]
    ConcurrencyLimitReached { limit: usize },
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session id already in use: {0}")]
    IdInUse(String),
}

#[derive(Debug, Error)]
pub enum SignallingError {
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("connection timed out waiting for peer")]
    ConnectionTimeout,
    #[error("malformed offer: {0}")]
    MalformedOffer(String),
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler raised an error: {0}")]
    UserCode(String),
    #[error("handler shutdown failed: {0}")]
    ShutdownFailed(String),
}

#[derive(Debug, Error)]
pub enum ControlChannelError {
    #[error("control channel is not open")]
    NotOpen,
    #[error("failed to serialize control message: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("session.concurrency_limit must be > 0 when set")]
    ZeroConcurrencyLimit,
    #[error("session.time_limit_secs must be > 0 when set")]
    ZeroTimeLimit,
    #[error("codec.output_frame_samples must be > 0")]
    ZeroFrameSamples,
    #[error("vad.audio_chunk_duration_secs must be > 0")]
    ZeroChunkDuration,
    #[error("vad.started_talking_threshold_secs ({threshold}) cannot exceed vad.audio_chunk_duration_secs ({chunk})")]
    ThresholdExceedsChunkDuration { threshold: f64, chunk: f64 },
    #[error("queue.output_queue_capacity must be > 0")]
    ZeroOutputQueueCapacity,
    #[error("queue.inbound_queue_capacity must be > 0")]
    ZeroInboundQueueCapacity,
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
}

/// Top-level error used at crate boundaries (HTTP handlers, public entry points).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Vad(#[from] VadError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Signalling(#[from] SignallingError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    ControlChannel(#[from] ControlChannelError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;
