//! Real-time media routing and turn-taking server: connects browser/phone
//! clients to user-supplied stream handlers over WebRTC and WebSocket.

pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod handler;
pub mod metrics;
pub mod session;
pub mod signaling;
pub mod stopword;
pub mod turn_taking;
pub mod vad;

pub use config::Config;
pub use error::{Result, ServerError};
pub use frame::{AudioFrame, VideoFrame, Yield};
pub use handler::Handler;
pub use session::SessionManager;
