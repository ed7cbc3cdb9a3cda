//! Session Manager: session id assignment, admission control, lifecycle,
//! per-session input snapshot and bounded output queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::SessionError;
use crate::frame::AdditionalOutputs;
use crate::handler::HandlerRuntime;

/// Reserved sentinel occupying index 0 of every input snapshot.
pub const WEBRTC_VALUE_SENTINEL: &str = "__webrtc_value__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Connected,
    Active,
    Draining,
    Closed,
}

/// Mutex-protected input snapshot: readers take a stable clone under the
/// lock and release it before invoking user code.
#[derive(Default)]
struct InputSnapshot {
    values: Vec<serde_json::Value>,
}

/// Bounded, oldest-drop output queue for a session's `AdditionalOutputs`.
struct OutputQueue {
    capacity: usize,
    items: VecDeque<AdditionalOutputs>,
    dropped: u64,
}

impl OutputQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Returns `true` if the oldest entry was dropped to make room.
    fn push(&mut self, item: AdditionalOutputs) -> bool {
        let overflowed = self.items.len() >= self.capacity;
        if overflowed {
            self.items.pop_front();
            self.dropped += 1;
        }
        self.items.push_back(item);
        overflowed
    }

    fn pop_oldest(&mut self) -> Option<AdditionalOutputs> {
        self.items.pop_front()
    }
}

pub struct Session {
    pub id: String,
    pub client_id: Option<String>,
    state: RwLock<SessionState>,
    input: RwLock<InputSnapshot>,
    output: RwLock<OutputQueue>,
    output_notify: broadcast::Sender<()>,
    created_at: Instant,
    last_inbound_activity: RwLock<Instant>,
    time_limit: Option<Duration>,
    pub handler: HandlerRuntime,
}

impl Session {
    fn new(
        id: String,
        client_id: Option<String>,
        handler: HandlerRuntime,
        output_capacity: usize,
        time_limit: Option<Duration>,
    ) -> Arc<Self> {
        let (output_notify, _) = broadcast::channel(16);
        Arc::new(Self {
            id,
            client_id,
            state: RwLock::new(SessionState::Negotiating),
            input: RwLock::new(InputSnapshot {
                values: vec![serde_json::Value::String(WEBRTC_VALUE_SENTINEL.to_string())],
            }),
            output: RwLock::new(OutputQueue::new(output_capacity)),
            output_notify,
            created_at: Instant::now(),
            last_inbound_activity: RwLock::new(Instant::now()),
            time_limit,
            handler,
        })
    }

    /// Subscribe to output-queue push notifications; used by the output
    /// hook's SSE stream to wake up without polling.
    pub fn subscribe_output(&self) -> broadcast::Receiver<()> {
        self.output_notify.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn set_state(&self, state: SessionState) {
        let mut current = self.state.write().await;
        if *current != state {
            log::debug!("session {} state change: {:?} -> {:?}", self.id, *current, state);
            *current = state;
        }
    }

    /// Atomically replace the input snapshot; index 0 (the sentinel) is
    /// preserved and the caller's values are appended after it. Mirrors the
    /// snapshot into the handler runtime's argument state so a generator
    /// blocked in `wait_for_args` wakes up.
    pub async fn set_input(&self, values: Vec<serde_json::Value>) {
        let full = {
            let mut snapshot = self.input.write().await;
            snapshot.values = std::iter::once(serde_json::Value::String(WEBRTC_VALUE_SENTINEL.to_string()))
                .chain(values)
                .collect();
            snapshot.values.clone()
        };
        self.handler.set_args(full).await;
    }

    /// A stable clone of the current input snapshot, safe to pass into user
    /// code after the lock is released.
    pub async fn input_snapshot(&self) -> Vec<serde_json::Value> {
        self.input.read().await.values.clone()
    }

    /// Queue output for delivery through the output hook; returns `true` if
    /// the oldest entry was dropped due to capacity (caller should emit a
    /// `warning` control message).
    pub async fn push_output(&self, item: AdditionalOutputs) -> bool {
        let overflowed = {
            let mut queue = self.output.write().await;
            queue.push(item)
        };
        let _ = self.output_notify.send(());
        overflowed
    }

    pub async fn fetch_latest_output(&self) -> Option<AdditionalOutputs> {
        self.output.write().await.pop_oldest()
    }

    pub async fn touch_inbound(&self) {
        *self.last_inbound_activity.write().await = Instant::now();
    }

    pub async fn inbound_idle_time(&self) -> Duration {
        self.last_inbound_activity.read().await.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// `true` once `time_limit` has elapsed since session creation.
    pub fn time_limit_expired(&self) -> bool {
        match self.time_limit {
            Some(limit) => self.age() >= limit,
            None => false,
        }
    }
}

/// Admission control + registry for all live sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    concurrency_limit: Option<usize>,
    output_queue_capacity: usize,
    time_limit: Option<Duration>,
}

impl SessionManager {
    pub fn new(concurrency_limit: Option<usize>, output_queue_capacity: usize, time_limit_secs: Option<u64>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            concurrency_limit,
            output_queue_capacity,
            time_limit: time_limit_secs.map(Duration::from_secs),
        }
    }

    /// Admit a new session. `requested_id` is the client-supplied id (e.g.
    /// WebRTC's `webrtc_id`); adopted if free, otherwise a fresh uuid is
    /// generated and returned to the caller. `phone_mode` pre-seeds the
    /// handler runtime's argument state with `[None]` for transports (the
    /// telephone bridge) that never issue a `/input` call.
    pub async fn create_session(
        &self,
        requested_id: Option<String>,
        handler: Box<dyn crate::handler::Handler>,
        inbound_queue_capacity: usize,
        phone_mode: bool,
    ) -> Result<Arc<Session>, SessionError> {
        let mut sessions = self.sessions.write().await;
        if let Some(limit) = self.concurrency_limit {
            if sessions.len() >= limit {
                return Err(SessionError::ConcurrencyLimitReached { limit });
            }
        }

        let id = match requested_id {
            Some(candidate) if !sessions.contains_key(&candidate) => candidate,
            Some(_) => Uuid::new_v4().to_string(),
            None => Uuid::new_v4().to_string(),
        };
        if sessions.contains_key(&id) {
            return Err(SessionError::IdInUse(id));
        }

        let runtime = HandlerRuntime::new_with_phone_mode(handler, inbound_queue_capacity, phone_mode);
        let session = Session::new(id.clone(), None, runtime, self.output_queue_capacity, self.time_limit);
        sessions.insert(id, session.clone());
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.write().await.remove(id);
        if let Some(ref s) = session {
            s.set_state(SessionState::Draining).await;
            if let Err(e) = s.handler.shutdown().await {
                log::warn!("session {} handler shutdown error: {}", s.id, e);
            }
            s.set_state(SessionState::Closed).await;
        }
        session
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Terminate sessions whose `time_limit` has expired or that have been
    /// closed/draining past the given idle timeout.
    pub async fn cleanup_stale_sessions(&self, idle_timeout_secs: u64) {
        let mut to_remove = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                let state = session.state().await;
                let idle = session.inbound_idle_time().await;
                if session.time_limit_expired()
                    || state == SessionState::Closed
                    || (state == SessionState::Draining && idle.as_secs() > idle_timeout_secs)
                {
                    to_remove.push(id.clone());
                }
            }
        }
        for id in to_remove {
            self.remove_session(&id).await;
            log::info!("cleaned up stale session: {id}");
        }
    }

    pub async fn set_input(&self, id: &str, values: Vec<serde_json::Value>) -> Result<(), SessionError> {
        let session = self.get_session(id).await.ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.set_input(values).await;
        Ok(())
    }

    pub async fn fetch_latest_output(&self, id: &str) -> Result<Option<AdditionalOutputs>, SessionError> {
        let session = self.get_session(id).await.ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Ok(session.fetch_latest_output().await)
    }

    /// The session to stream output from, plus a fresh subscription to its
    /// push notifications. The caller drains queued entries and then awaits
    /// the subscription for more, ending when the session is removed.
    pub async fn output_stream_handle(&self, id: &str) -> Result<(Arc<Session>, broadcast::Receiver<()>), SessionError> {
        let session = self.get_session(id).await.ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let rx = session.subscribe_output();
        Ok((session, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, HandlerProperties, InboundFrame, OutboundFrame};

    #[derive(Default, Clone)]
    struct NoopHandler;
    impl Handler for NoopHandler {
        fn properties(&self) -> HandlerProperties {
            HandlerProperties {
                input_sample_rate: 16_000,
                output_sample_rate: 16_000,
                output_frame_samples: 320,
                expected_layout: crate::config::ChannelLayout::Mono,
            }
        }
        fn receive(&mut self, _frame: InboundFrame) {}
        fn emit(&mut self) -> Option<OutboundFrame> {
            None
        }
        fn shutdown(&mut self) {}
        fn copy(&self) -> Box<dyn Handler> {
            Box::new(NoopHandler)
        }
    }

    #[tokio::test]
    async fn admits_sessions_up_to_concurrency_limit() {
        let manager = SessionManager::new(Some(1), 8, None);
        let first = manager.create_session(None, Box::new(NoopHandler), 8, false).await;
        assert!(first.is_ok());
        let second = manager.create_session(None, Box::new(NoopHandler), 8, false).await;
        assert!(matches!(second, Err(SessionError::ConcurrencyLimitReached { limit: 1 })));
    }

    #[tokio::test]
    async fn adopts_requested_id_when_free_else_generates_fresh() {
        let manager = SessionManager::new(None, 8, None);
        let first = manager
            .create_session(Some("client-chosen".to_string()), Box::new(NoopHandler), 8, false)
            .await
            .unwrap();
        assert_eq!(first.id, "client-chosen");

        let second = manager
            .create_session(Some("client-chosen".to_string()), Box::new(NoopHandler), 8, false)
            .await
            .unwrap();
        assert_ne!(second.id, "client-chosen");
    }

    #[tokio::test]
    async fn input_snapshot_keeps_sentinel_at_index_zero() {
        let manager = SessionManager::new(None, 8, None);
        let session = manager.create_session(None, Box::new(NoopHandler), 8, false).await.unwrap();
        session.set_input(vec![serde_json::json!("hello")]).await;
        let snapshot = session.input_snapshot().await;
        assert_eq!(snapshot[0], serde_json::Value::String(WEBRTC_VALUE_SENTINEL.to_string()));
        assert_eq!(snapshot[1], serde_json::json!("hello"));
    }

    #[tokio::test]
    async fn output_queue_drops_oldest_on_overflow() {
        let manager = SessionManager::new(None, 2, None);
        let session = manager.create_session(None, Box::new(NoopHandler), 8, false).await.unwrap();
        session.push_output(AdditionalOutputs(serde_json::json!(1))).await;
        session.push_output(AdditionalOutputs(serde_json::json!(2))).await;
        let overflowed = session.push_output(AdditionalOutputs(serde_json::json!(3))).await;
        assert!(overflowed);
        let first = session.fetch_latest_output().await.unwrap();
        assert_eq!(first.0, serde_json::json!(2));
    }

    #[tokio::test]
    async fn lifecycle_moves_through_connected_active_draining_closed() {
        let manager = SessionManager::new(None, 8, None);
        let session = manager.create_session(None, Box::new(NoopHandler), 8, false).await.unwrap();
        assert_eq!(session.state().await, SessionState::Negotiating);
        session.set_state(SessionState::Connected).await;
        assert_eq!(session.state().await, SessionState::Connected);
        session.set_state(SessionState::Active).await;
        assert_eq!(session.state().await, SessionState::Active);
        manager.remove_session(&session.id).await;
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn phone_mode_session_sets_args_without_input_call() {
        let manager = SessionManager::new(None, 8, None);
        let session = manager.create_session(None, Box::new(NoopHandler), 8, true).await.unwrap();
        let args = session.handler.wait_for_args().await;
        assert_eq!(args, vec![serde_json::Value::Null]);
    }

    #[tokio::test]
    async fn set_input_wakes_a_waiting_handler() {
        let manager = SessionManager::new(None, 8, None);
        let session = manager.create_session(None, Box::new(NoopHandler), 8, false).await.unwrap();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.handler.wait_for_args().await })
        };
        tokio::task::yield_now().await;
        session.set_input(vec![serde_json::json!("go")]).await;
        let args = waiter.await.unwrap();
        assert_eq!(args[1], serde_json::json!("go"));
    }

    #[tokio::test]
    async fn remove_session_shuts_down_handler_and_removes_from_registry() {
        let manager = SessionManager::new(None, 8, None);
        let session = manager.create_session(None, Box::new(NoopHandler), 8, false).await.unwrap();
        let id = session.id.clone();
        assert!(manager.remove_session(&id).await.is_some());
        assert!(manager.get_session(&id).await.is_none());
    }

    #[tokio::test]
    async fn output_subscription_wakes_on_push() {
        let manager = SessionManager::new(None, 8, None);
        let session = manager.create_session(None, Box::new(NoopHandler), 8, false).await.unwrap();
        let mut rx = session.subscribe_output();
        session.push_output(AdditionalOutputs(serde_json::json!("hi"))).await;
        rx.recv().await.expect("notified on push");
    }
}
