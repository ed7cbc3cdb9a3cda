//! Telephone bridge mount point: bridges an external PSTN provider to a
//! WebSocket audio session, mu-law 8 kHz both ways, no additional inputs.
//!
//! The framing is identical to `/websocket/offer` — both speak the same
//! `start`/`media`/`stop` event stream — so this module is a thin,
//! separately-routed entry point rather than a second implementation.

use std::sync::Arc;

use axum::extract::ws::WebSocket;

use crate::handler::Handler;
use crate::session::SessionManager;

use super::websocket::{self, ConnectionOptions};

/// A session created through the telephone mount never receives a `/input`
/// call, so `phone_mode` is always forced on here regardless of what the
/// caller passed, pre-seeding `wait_for_args` so a generator never deadlocks
/// waiting on arguments that will never arrive.
pub async fn handle_connection(
    socket: WebSocket,
    session_manager: Arc<SessionManager>,
    handler_factory: impl Fn() -> Box<dyn Handler> + Send + 'static,
    inbound_queue_capacity: usize,
    mut options: ConnectionOptions,
) {
    options.phone_mode = true;
    websocket::handle_connection(socket, session_manager, handler_factory, inbound_queue_capacity, options).await;
}
