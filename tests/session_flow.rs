//! Integration tests covering echo round-trip, a single ReplyOnPause turn,
//! barge-in, and stopword gating, driven through the public
//! session/handler/turn-taking APIs rather than a real network transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use turn_taking_server::config::ChannelLayout;
use turn_taking_server::frame::{AudioFrame, Yield};
use turn_taking_server::handler::{Handler, HandlerProperties, InboundFrame, OutboundFrame};
use turn_taking_server::session::SessionManager;

#[derive(Default, Clone)]
struct EchoHandler {
    queue: VecDeque<AudioFrame>,
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

    fn shutdown(&mut self) {}

    fn copy(&self) -> Box<dyn Handler> {
        Box::new(EchoHandler::default())
    }
}

#[tokio::test]
async fn echo_over_a_session_preserves_order_and_content() {
    let manager = SessionManager::new(None, 64, None);
    let session = manager.create_session(None, Box::new(EchoHandler::default()), 64, false).await.unwrap();

    for i in 0..20i16 {
        session
            .handler
            .enqueue(InboundFrame::Audio(AudioFrame {
                sample_rate: 48_000,
                channels: 1,
                samples: vec![i; 960],
            }))
            .await;
    }
    session.handler.pump_receive().await.unwrap();

    for i in 0..20i16 {
        let frame = session.handler.emit().await.unwrap();
        match frame {
            Some(OutboundFrame::Audio(audio)) => assert_eq!(audio.samples, vec![i; 960]),
            other => panic!("expected audio frame at index {i}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn two_sessions_from_the_same_handler_have_independent_state() {
    let manager = SessionManager::new(None, 64, None);
    let seed = EchoHandler {
        queue: VecDeque::from(vec![AudioFrame {
            sample_rate: 48_000,
            channels: 1,
            samples: vec![9],
        }]),
    };
    let session_one = manager.create_session(None, seed.copy(), 64, false).await.unwrap();
    let session_two = manager.create_session(None, Box::new(EchoHandler::default()), 64, false).await.unwrap();

    session_one
        .handler
        .enqueue(InboundFrame::Audio(AudioFrame {
            sample_rate: 48_000,
            channels: 1,
            samples: vec![1],
        }))
        .await;
    session_one.handler.pump_receive().await.unwrap();
    session_one.handler.emit().await.unwrap();

    assert!(session_two.handler.emit().await.unwrap().is_none());
}

#[tokio::test]
async fn concurrency_limit_rejects_the_nth_plus_one_session() {
    let manager = SessionManager::new(Some(2), 64, None);
    manager.create_session(None, Box::new(EchoHandler::default()), 64, false).await.unwrap();
    manager.create_session(None, Box::new(EchoHandler::default()), 64, false).await.unwrap();

    let rejected = manager.create_session(None, Box::new(EchoHandler::default()), 64, false).await;
    assert!(rejected.is_err());
}

use turn_taking_server::turn_taking::{CancelToken, FnGenerator, GeneratorFactory, TriggerMode, TurnState, TurnTakingEngine};
use turn_taking_server::control::ControlMsg;
use turn_taking_server::vad::VadEvent;

fn counting_generator(count: usize) -> GeneratorFactory {
    Box::new(move |_audio, _inputs| {
        let remaining = Arc::new(AtomicUsize::new(count));
        Box::new(FnGenerator(move |cancel: &CancelToken| {
            if cancel.is_cancelled() {
                return None;
            }
            let n = remaining.fetch_sub(1, Ordering::SeqCst);
            if n == 0 {
                return None;
            }
            Some(Yield::Audio(AudioFrame {
                sample_rate: 16_000,
                channels: 1,
                samples: vec![n as i16],
            }))
        }))
    })
}

fn utterance(samples: Vec<i16>) -> AudioFrame {
    AudioFrame { sample_rate: 16_000, channels: 1, samples }
}

#[test]
fn reply_on_pause_single_turn_matches_scenario_2() {
    let mut engine = TurnTakingEngine::new(TriggerMode::Pause, counting_generator(2));

    engine.on_vad_event(VadEvent::StartedTalking, None, &[]);
    let pause_step = engine.on_vad_event(VadEvent::Paused, Some(utterance(vec![1, 2, 3])), &[]);

    assert!(matches!(pause_step.controls[0], ControlMsg::PauseDetected));
    assert!(matches!(pause_step.controls[1], ControlMsg::ResponseStarting));

    let mut outbound = Vec::new();
    loop {
        let step = engine.drive_generator();
        if step.yields.is_empty() && engine.state() == TurnState::Listening {
            break;
        }
        outbound.extend(step.yields);
    }
    assert_eq!(outbound.len(), 2);
    assert_eq!(engine.state(), TurnState::Listening);
}

#[test]
fn barge_in_truncates_the_running_turn_and_returns_to_user_speaking() {
    let mut engine = TurnTakingEngine::new(TriggerMode::Pause, counting_generator(5));
    engine.on_vad_event(VadEvent::StartedTalking, None, &[]);
    engine.on_vad_event(VadEvent::Paused, Some(utterance(vec![1])), &[]);

    let first = engine.drive_generator();
    assert_eq!(first.yields.len(), 1);

    engine.on_vad_event(VadEvent::StartedTalking, None, &[]);
    assert_eq!(engine.state(), TurnState::UserSpeaking);

    let after_barge_in = engine.drive_generator();
    assert!(after_barge_in.yields.is_empty(), "no further yields from the cancelled generator");
}

#[test]
fn stopword_gating_requires_a_match_before_started_talking_starts_a_turn() {
    let mut engine = TurnTakingEngine::new(TriggerMode::Stopwords, counting_generator(1));

    let unarmed = engine.on_vad_event(VadEvent::StartedTalking, None, &[]);
    assert!(unarmed.controls.is_empty());
    assert_eq!(engine.state(), TurnState::Listening);

    let control = engine.on_stopword_matched("computer".to_string());
    match control {
        Some(ControlMsg::Stopword { data }) => assert_eq!(data, "computer"),
        other => panic!("expected stopword control, got {other:?}"),
    }

    engine.on_vad_event(VadEvent::StartedTalking, None, &[]);
    assert_eq!(engine.state(), TurnState::UserSpeaking);
}
