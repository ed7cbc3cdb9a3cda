//! Pause/Stopword Turn-Taking Engine: converts a continuous inbound audio
//! stream into discrete user-utterance events and invokes a user generator
//! exactly once per utterance, interruptibly streaming its yields back to
//! the peer.
//!
//! The explicit `LISTENING` / `USER_SPEAKING` / `RESPONDING` enum with
//! `From`/transition methods follows the same state-machine style as
//! session lifecycle tracking elsewhere in this crate. Cooperative
//! cancellation uses a plain `Arc<AtomicBool>` flag plus `Notify` rather
//! than pulling in `tokio-util`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::control::{ControlChannel, ControlMsg};
use crate::frame::{AudioFrame, Yield};
use crate::vad::VadEvent;

/// Cooperative cancellation signal shared between the turn-taking state
/// machine and a running generator task.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Reset for the next utterance. Must only be called once no generator
    /// from the previous turn is still running.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Listening,
    UserSpeaking,
    Responding,
}

/// What begins collection of the next utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// ReplyOnPause: VAD `StartedTalking` alone starts the turn.
    Pause,
    /// ReplyOnStopwords: VAD `StartedTalking` plus a stopword match.
    Stopwords,
}

/// A user generator's output, consumed item by item until it returns.
pub trait TurnGenerator: Send {
    /// Produce the next yield, or `None` when the generator is finished.
    /// Implementations should check `cancel.is_cancelled()` between items
    /// and return `None` promptly once cancelled.
    fn next_yield(&mut self, cancel: &CancelToken) -> Option<Yield>;
}

/// A boxed closure-backed generator for simple handlers that don't need
/// their own type.
pub struct FnGenerator<F: FnMut(&CancelToken) -> Option<Yield> + Send>(pub F);

impl<F: FnMut(&CancelToken) -> Option<Yield> + Send> TurnGenerator for FnGenerator<F> {
    fn next_yield(&mut self, cancel: &CancelToken) -> Option<Yield> {
        (self.0)(cancel)
    }
}

/// Factory invoked once per utterance: given the collected utterance audio
/// and the current input snapshot tail, produce a fresh generator.
pub type GeneratorFactory =
    Box<dyn Fn(AudioFrame, &[serde_json::Value]) -> Box<dyn TurnGenerator> + Send + Sync>;

pub struct TurnTakingEngine {
    mode: TriggerMode,
    state: TurnState,
    factory: GeneratorFactory,
    cancel: CancelToken,
    current_generator: Option<Box<dyn TurnGenerator>>,
    /// True once a stopword has matched for the utterance currently being
    /// collected (ReplyOnStopwords only).
    stopword_armed: bool,
}

/// Result of driving the engine one step: outbound media/extra yields plus
/// control messages to send, in order.
#[derive(Default)]
pub struct TurnStep {
    pub yields: Vec<Yield>,
    pub controls: Vec<ControlMsg>,
}

impl TurnTakingEngine {
    pub fn new(mode: TriggerMode, factory: GeneratorFactory) -> Self {
        Self {
            mode,
            state: TurnState::Listening,
            factory,
            cancel: CancelToken::new(),
            current_generator: None,
            stopword_armed: false,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Record a stopword match. Only meaningful in `TriggerMode::Stopwords`
    /// while `LISTENING`; arms the next `StartedTalking` to begin a turn.
    pub fn on_stopword_matched(&mut self, matched: String) -> Option<ControlMsg> {
        if self.mode == TriggerMode::Stopwords && self.state == TurnState::Listening {
            self.stopword_armed = true;
            Some(ControlMsg::Stopword { data: matched })
        } else {
            None
        }
    }

    /// Feed one VAD event. `utterance` is populated on `Paused`.
    pub fn on_vad_event(&mut self, event: VadEvent, utterance: Option<AudioFrame>, inputs: &[serde_json::Value]) -> TurnStep {
        let mut step = TurnStep::default();
        match (self.state, event) {
            (TurnState::Listening, VadEvent::StartedTalking) => {
                let armed = match self.mode {
                    TriggerMode::Pause => true,
                    TriggerMode::Stopwords => self.stopword_armed,
                };
                if armed {
                    self.state = TurnState::UserSpeaking;
                }
            }
            (TurnState::UserSpeaking, VadEvent::Paused) => {
                self.stopword_armed = false;
                self.state = TurnState::Responding;
                step.controls.push(ControlMsg::PauseDetected);
                let audio = utterance.unwrap_or(AudioFrame::silence(16_000, 1, 0));
                self.cancel = CancelToken::new();
                self.current_generator = Some((self.factory)(audio, inputs));
                step.controls.push(ControlMsg::ResponseStarting);
            }
            (TurnState::Responding, VadEvent::StartedTalking) => {
                // Barge-in: cancel the running generator cooperatively and
                // fall straight back into collecting the new utterance.
                self.cancel.cancel();
                self.current_generator = None;
                self.state = TurnState::UserSpeaking;
            }
            _ => {}
        }
        step
    }

    /// Pull the next item from the running generator, if any. Call this in
    /// a loop from the outbound pump while `state() == Responding`.
    pub fn drive_generator(&mut self) -> TurnStep {
        let mut step = TurnStep::default();
        let Some(generator) = self.current_generator.as_mut() else {
            return step;
        };
        if self.cancel.is_cancelled() {
            self.current_generator = None;
            return step;
        }
        match generator.next_yield(&self.cancel) {
            Some(item) => {
                if !self.cancel.is_cancelled() {
                    step.yields.push(item);
                }
            }
            None => {
                self.current_generator = None;
                self.state = TurnState::Listening;
            }
        }
        step
    }

    /// Called when the underlying stream ends while `RESPONDING`: cancel
    /// and emit a single truncation warning.
    pub fn on_stream_end(&mut self) -> Option<ControlMsg> {
        if self.state == TurnState::Responding {
            self.cancel.cancel();
            self.current_generator = None;
            self.state = TurnState::Listening;
            Some(ControlMsg::warning("response truncated: stream ended"))
        } else {
            None
        }
    }

    /// Called when the generator panics or raises: surface an `error`
    /// control message and return to `LISTENING` without crashing the
    /// session.
    pub fn on_generator_error(&mut self, message: impl Into<String>) -> ControlMsg {
        self.cancel.cancel();
        self.current_generator = None;
        self.state = TurnState::Listening;
        ControlMsg::error(message)
    }
}

/// Send every control message in a [`TurnStep`] in order, over the given
/// channel, preserving the guarantee that `pause_detected` precedes
/// `response_starting`.
pub async fn send_step_controls(
    channel: &dyn ControlChannel,
    step: &TurnStep,
) -> Result<(), crate::error::ControlChannelError> {
    for msg in &step.controls {
        channel.send(msg.clone()).await?;
    }
    Ok(())
}

/// Minimal default generator: yields the collected utterance back once and
/// finishes. Stands in for a user-registered `ReplyOnPause`/
/// `ReplyOnStopwords` generator until one is mounted — mirrors the Handler
/// Runtime's `EchoHandler` default in the same role.
pub fn echo_generator_factory() -> GeneratorFactory {
    Box::new(|utterance, _inputs| {
        let mut remaining = Some(Yield::Audio(utterance));
        Box::new(FnGenerator(move |_cancel: &CancelToken| remaining.take()))
    })
}

/// Drives a [`TurnTakingEngine`] from an async event loop. Generators are
/// user code and may block, so every step runs on the blocking-pool the same
/// way `HandlerRuntime` bridges synchronous `Handler` methods.
#[derive(Clone)]
pub struct TurnTakingRuntime {
    engine: Arc<Mutex<TurnTakingEngine>>,
}

impl TurnTakingRuntime {
    pub fn new(mode: TriggerMode, factory: GeneratorFactory) -> Self {
        Self {
            engine: Arc::new(Mutex::new(TurnTakingEngine::new(mode, factory))),
        }
    }

    pub async fn state(&self) -> TurnState {
        self.engine.lock().await.state()
    }

    pub async fn on_stopword_matched(&self, matched: String) -> Option<ControlMsg> {
        self.engine.lock().await.on_stopword_matched(matched)
    }

    pub async fn on_vad_event(&self, event: VadEvent, utterance: Option<AudioFrame>, inputs: Vec<serde_json::Value>) -> TurnStep {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = engine.blocking_lock();
            guard.on_vad_event(event, utterance, &inputs)
        })
        .await
        .unwrap_or_default()
    }

    pub async fn drive_generator(&self) -> TurnStep {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = engine.blocking_lock();
            guard.drive_generator()
        })
        .await
        .unwrap_or_default()
    }

    pub async fn on_stream_end(&self) -> Option<ControlMsg> {
        self.engine.lock().await.on_stream_end()
    }

    pub async fn on_generator_error(&self, message: impl Into<String> + Send + 'static) -> ControlMsg {
        self.engine.lock().await.on_generator_error(message)
    }
}
