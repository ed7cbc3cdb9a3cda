//! Signalling & Negotiation and Public API Surface.

pub mod http;
pub mod telephone;
pub mod webrtc;
pub mod websocket;
