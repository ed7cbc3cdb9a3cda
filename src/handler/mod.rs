//! Handler Runtime: owns one handler instance per session,
//! drives its receive/emit loop, bridges synchronous handlers into the
//! async event loop with a bounded worker pool.
//!
//! Built on the multi-source `tokio::select!` pump/drain-loop idiom used
//! for session driving elsewhere in this crate (inbound/outbound/event
//! multiplexing), generalized here into a three-fiber model: inbound
//! pump, handler pump, outbound pump.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::error::HandlerError;
use crate::frame::{AudioFrame, VideoFrame};

/// Declared handler properties negotiated against the peer's media.
#[derive(Debug, Clone)]
pub struct HandlerProperties {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub output_frame_samples: usize,
    pub expected_layout: crate::config::ChannelLayout,
}

/// One inbound unit handed to `receive`.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

/// One outbound unit returned by `emit`.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

/// The contract a user provides.
///
/// `copy` is the mandatory deep-copy factory: every new session gets a
/// fresh handler instance with no shared runtime state, so concurrent
/// sessions built from the same registered handler never interfere.
pub trait Handler: Send {
    fn properties(&self) -> HandlerProperties;

    /// Called once after `copy`, before the first `receive`/`emit`.
    fn start_up(&mut self) {}

    /// Called once per inbound frame. Must not block.
    fn receive(&mut self, frame: InboundFrame);

    /// Called in a loop by the outbound pump. Must not block; `None` means
    /// "nothing to send now".
    fn emit(&mut self) -> Option<OutboundFrame>;

    /// Called exactly once on teardown. Must be idempotent.
    fn shutdown(&mut self);

    /// Mandatory deep-copy factory.
    fn copy(&self) -> Box<dyn Handler>;
}

/// Bounded FIFO in front of a handler's `receive`, with oldest-drop
/// overflow.
struct InboundQueue {
    capacity: usize,
    items: VecDeque<InboundFrame>,
    dropped: u64,
}

impl InboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::new(),
            dropped: 0,
        }
    }

    fn push(&mut self, frame: InboundFrame) -> bool {
        let overflowed = self.items.len() >= self.capacity;
        if overflowed {
            self.items.pop_front();
            self.dropped += 1;
        }
        self.items.push_back(frame);
        overflowed
    }

    fn pop(&mut self) -> Option<InboundFrame> {
        self.items.pop_front()
    }
}

/// Drives one session's handler. Synchronous handlers are bridged onto a
/// bounded worker pool via `spawn_blocking`; async orchestration
/// (turn-taking, control messages) happens around this runtime, not inside
/// it — `HandlerRuntime` only owns the receive/emit contract.
pub struct HandlerRuntime {
    handler: Arc<Mutex<Box<dyn Handler>>>,
    inbound: Arc<Mutex<InboundQueue>>,
    /// Latest `/input` argument snapshot. `phone_mode` sessions (telephone
    /// bridges, which never see a `/input` call) are pre-populated with
    /// `[None]` so a generator waiting on args never deadlocks.
    latest_args: Arc<Mutex<Vec<serde_json::Value>>>,
    args_notify: Arc<Notify>,
}

impl HandlerRuntime {
    pub fn new(handler: Box<dyn Handler>, inbound_capacity: usize) -> Self {
        Self::new_with_phone_mode(handler, inbound_capacity, false)
    }

    /// `phone_mode = true` pre-seeds the argument state with `[None]` so
    /// `wait_for_args`/`wait_for_args_sync` return immediately for sessions
    /// that never receive a `/input` call (telephone bridges).
    pub fn new_with_phone_mode(mut handler: Box<dyn Handler>, inbound_capacity: usize, phone_mode: bool) -> Self {
        handler.start_up();
        let initial = if phone_mode { vec![serde_json::Value::Null] } else { Vec::new() };
        Self {
            handler: Arc::new(Mutex::new(handler)),
            inbound: Arc::new(Mutex::new(InboundQueue::new(inbound_capacity))),
            latest_args: Arc::new(Mutex::new(initial)),
            args_notify: Arc::new(Notify::new()),
        }
    }

    /// Record the latest argument snapshot (mirrors the session's `/input`
    /// values) and wake anyone blocked in `wait_for_args`.
    pub async fn set_args(&self, values: Vec<serde_json::Value>) {
        *self.latest_args.lock().await = values;
        self.args_notify.notify_waiters();
    }

    /// The most recently set argument snapshot, without waiting.
    pub async fn latest_args(&self) -> Vec<serde_json::Value> {
        self.latest_args.lock().await.clone()
    }

    /// Wait until at least one argument snapshot has been set, then return
    /// it. A `phone_mode` runtime already has `[None]` seeded and returns
    /// immediately.
    pub async fn wait_for_args(&self) -> Vec<serde_json::Value> {
        loop {
            let notified = self.args_notify.notified();
            {
                let values = self.latest_args.lock().await;
                if !values.is_empty() {
                    return values.clone();
                }
            }
            notified.await;
        }
    }

    /// Blocking variant of [`Self::wait_for_args`] for synchronous generator
    /// code driven from a `spawn_blocking` context.
    pub fn wait_for_args_sync(&self) -> Vec<serde_json::Value> {
        tokio::runtime::Handle::current().block_on(self.wait_for_args())
    }

    /// Enqueue an inbound frame. Never blocks the transport: on overflow,
    /// the oldest frame is dropped and the caller is told to emit a
    /// `warning` control message.
    pub async fn enqueue(&self, frame: InboundFrame) -> bool {
        let mut queue = self.inbound.lock().await;
        queue.push(frame)
    }

    /// Drain the inbound queue into the handler's `receive`. Runs on a
    /// blocking-pool task since `receive` is user code that may not be
    /// async-safe.
    pub async fn pump_receive(&self) -> Result<(), HandlerError> {
        loop {
            let next = {
                let mut queue = self.inbound.lock().await;
                queue.pop()
            };
            let Some(frame) = next else { break };
            let handler = self.handler.clone();
            let result = tokio::task::spawn_blocking(move || {
                let mut guard = handler.blocking_lock();
                guard.receive(frame);
            })
            .await;
            if let Err(e) = result {
                return Err(HandlerError::UserCode(e.to_string()));
            }
        }
        Ok(())
    }

    /// Poll `emit` once. Runs on the blocking pool the same way `receive`
    /// does, since user `emit` implementations are synchronous by default.
    pub async fn emit(&self) -> Result<Option<OutboundFrame>, HandlerError> {
        let handler = self.handler.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = handler.blocking_lock();
            guard.emit()
        })
        .await
        .map_err(|e| HandlerError::UserCode(e.to_string()))
    }

    pub async fn shutdown(&self) -> Result<(), HandlerError> {
        let handler = self.handler.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = handler.blocking_lock();
            guard.shutdown();
        })
        .await
        .map_err(|e| HandlerError::ShutdownFailed(e.to_string()))
    }

    pub async fn properties(&self) -> HandlerProperties {
        self.handler.lock().await.properties()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelLayout;

    #[derive(Default, Clone)]
    struct EchoHandler {
        queue: VecDeque<AudioFrame>,
        shutdown_calls: u32,
    }

    impl Handler for EchoHandler {
        fn properties(&self) -> HandlerProperties {
            HandlerProperties {
                input_sample_rate: 48_000,
                output_sample_rate: 48_000,
                output_frame_samples: 960,
                expected_layout: ChannelLayout::Mono,
            }
        }

        fn receive(&mut self, frame: InboundFrame) {
            if let InboundFrame::Audio(audio) = frame {
                self.queue.push_back(audio);
            }
        }

        fn emit(&mut self) -> Option<OutboundFrame> {
            self.queue.pop_front().map(OutboundFrame::Audio)
        }

        fn shutdown(&mut self) {
            self.shutdown_calls += 1;
        }

        fn copy(&self) -> Box<dyn Handler> {
            Box::new(EchoHandler::default())
        }
    }

    #[tokio::test]
    async fn echo_handler_round_trips_frames_in_order() {
        let runtime = HandlerRuntime::new(Box::new(EchoHandler::default()), 8);
        for i in 0..5 {
            runtime
                .enqueue(InboundFrame::Audio(AudioFrame {
                    sample_rate: 48_000,
                    channels: 1,
                    samples: vec![i as i16],
                }))
                .await;
        }
        runtime.pump_receive().await.unwrap();

        for i in 0..5 {
            let frame = runtime.emit().await.unwrap();
            match frame {
                Some(OutboundFrame::Audio(audio)) => assert_eq!(audio.samples, vec![i as i16]),
                other => panic!("expected audio frame, got {other:?}"),
            }
        }
        assert!(runtime.emit().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_frame() {
        let runtime = HandlerRuntime::new(Box::new(EchoHandler::default()), 2);
        for i in 0..4 {
            runtime
                .enqueue(InboundFrame::Audio(AudioFrame {
                    sample_rate: 48_000,
                    channels: 1,
                    samples: vec![i as i16],
                }))
                .await;
        }
        runtime.pump_receive().await.unwrap();
        let first = runtime.emit().await.unwrap();
        match first {
            Some(OutboundFrame::Audio(audio)) => assert_eq!(audio.samples, vec![2i16]),
            other => panic!("expected oldest-dropped frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn copy_produces_independent_state() {
        let original = EchoHandler {
            queue: VecDeque::from(vec![AudioFrame {
                sample_rate: 48_000,
                channels: 1,
                samples: vec![7],
            }]),
            shutdown_calls: 0,
        };
        let copied = original.copy();
        let runtime = HandlerRuntime::new(copied, 8);
        assert!(runtime.emit().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let runtime = HandlerRuntime::new(Box::new(EchoHandler::default()), 8);
        runtime.shutdown().await.unwrap();
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn phone_mode_wait_for_args_never_blocks() {
        let runtime = HandlerRuntime::new_with_phone_mode(Box::new(EchoHandler::default()), 8, true);
        let args = tokio::time::timeout(std::time::Duration::from_millis(50), runtime.wait_for_args())
            .await
            .expect("phone_mode must not deadlock waiting for args");
        assert_eq!(args, vec![serde_json::Value::Null]);
    }

    #[tokio::test]
    async fn wait_for_args_resolves_once_set_args_is_called() {
        let runtime = Arc::new(HandlerRuntime::new(Box::new(EchoHandler::default()), 8));
        let waiter = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.wait_for_args().await })
        };
        tokio::task::yield_now().await;
        runtime.set_args(vec![serde_json::json!("hello")]).await;
        let args = waiter.await.unwrap();
        assert_eq!(args, vec![serde_json::json!("hello")]);
    }
}
