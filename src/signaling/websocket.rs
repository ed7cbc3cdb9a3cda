//! WebSocket media path, audio-only send-receive: `{event:"start"}` /
//! `{event:"media"}` / `{event:"stop"}` framing, mu-law@8kHz inbound,
//! transcoded to/from the handler's declared rate through the Frame Codec.
//!
//! One task reads the socket and dispatches; a second task owns the
//! sender half and drains an outbound mpsc channel, so control messages
//! and media frames never contend over the same sink.
//!
//! A session runs one of two pipelines, chosen at connection time:
//! - raw `Handler`: decode -> Frame Codec -> `handler.receive`/`emit` ->
//!   Frame Codec -> encode, matching the echo-style contract.
//! - turn-taking: decode -> Frame Codec -> `VadGate` -> (`StopwordDetector`
//!   when gated) -> `TurnTakingEngine` -> user generator -> Frame Codec ->
//!   encode, per [`TurnTakingFactory`].

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::codec::{mulaw, AudioCodec};
use crate::config::{StopwordConfig, VadConfig};
use crate::control::ControlMsg;
use crate::frame::{AudioFrame, Yield};
use crate::handler::{Handler, HandlerProperties, InboundFrame, OutboundFrame};
use crate::session::SessionManager;
use crate::stopword::{NullSttModel, StopwordDetector};
use crate::turn_taking::{GeneratorFactory, TriggerMode, TurnState, TurnTakingRuntime};
use crate::vad::{EnergyVadModel, VadEvent, VadGate};

const TELEPHONE_SAMPLE_RATE: u32 = 8_000;
/// Frame size used to re-chunk outbound audio before mu-law encoding: 20ms
/// at the telephone sample rate.
const OUTBOUND_REFRAME_SAMPLES: usize = 160;

/// Registration for a generator-based session, distinct from the raw
/// `Handler` contract: a `/websocket/offer` or `/telephone/*` connection
/// built with one of these runs `VadGate`/`StopwordDetector`/
/// `TurnTakingEngine` instead of calling `handler.receive`/`emit` directly.
pub struct TurnTakingFactory {
    pub mode: TriggerMode,
    /// Declares the generator's native audio rate the same way
    /// `Handler::properties` does for a raw handler, so the Frame Codec can
    /// be built without an actual `Handler` instance.
    pub properties: HandlerProperties,
    pub make_generator_factory: Box<dyn Fn() -> GeneratorFactory + Send + Sync>,
}

/// Per-connection configuration threaded from `AppState` down into
/// `handle_connection`.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Pre-seeds the handler runtime's argument state with `[None]` so a
    /// generator's `wait_for_args` never deadlocks on a transport (the
    /// telephone bridge) that has no `/input` call.
    pub phone_mode: bool,
    pub turn_taking: Option<Arc<TurnTakingFactory>>,
    pub vad: VadConfig,
    pub stopword: StopwordConfig,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum InboundEvent {
    Start { websocket_id: Option<String> },
    Media { media: MediaPayload },
    Stop,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum OutboundEvent {
    Media { media: MediaPayload },
}

/// One item the single writer task can emit to the socket.
enum OutboundItem {
    Control(ControlMsg),
    Media(Vec<u8>),
}

/// Wire-format delivery seam for whatever `TurnTakingPump`/the raw handler
/// path produce: a mu-law WebSocket, an Opus WebRTC track, or a test harness
/// can each implement this the way they need to without the pump knowing
/// which transport it's driving.
#[async_trait::async_trait]
pub(crate) trait OutboundSink: Send {
    async fn send_control(&mut self, msg: ControlMsg);
    async fn send_audio_frame(&mut self, frame: AudioFrame);
}

/// Re-frames through a per-connection `AudioCodec` and mu-law-encodes onto
/// the WebSocket/telephone outbound channel.
pub(crate) struct MulawSink<'a> {
    pub codec: &'a mut AudioCodec,
    pub tx: &'a tokio::sync::mpsc::UnboundedSender<OutboundItem>,
}

#[async_trait::async_trait]
impl OutboundSink for MulawSink<'_> {
    async fn send_control(&mut self, msg: ControlMsg) {
        let _ = self.tx.send(OutboundItem::Control(msg));
    }

    async fn send_audio_frame(&mut self, frame: AudioFrame) {
        match self.codec.process(&frame) {
            Ok((frames, _)) => {
                for out in frames {
                    let _ = self.tx.send(OutboundItem::Media(mulaw::encode(&out.samples)));
                }
            }
            Err(e) => log::warn!("outbound codec error: {e}"),
        }
    }
}

/// Routes one decoded, codec-converted native-rate chunk through
/// `VadGate`/`StopwordDetector`/`TurnTakingEngine`, delivering controls and
/// audio yields through whatever [`OutboundSink`] the caller supplies —
/// shared by the WebSocket/telephone path and the WebRTC path alike.
pub(crate) struct TurnTakingPump {
    runtime: TurnTakingRuntime,
    vad: VadGate,
    stopwords: Option<StopwordDetector>,
    mode: TriggerMode,
}

impl TurnTakingPump {
    pub(crate) fn new(factory: &TurnTakingFactory, vad_config: &VadConfig, stopword_config: &StopwordConfig) -> Self {
        let stopwords = match factory.mode {
            TriggerMode::Stopwords => Some(StopwordDetector::new(
                Box::new(NullSttModel),
                stopword_config,
                vad_config.native_sample_rate,
            )),
            TriggerMode::Pause => None,
        };
        Self {
            runtime: TurnTakingRuntime::new(factory.mode, (factory.make_generator_factory)()),
            vad: VadGate::new(Box::new(EnergyVadModel::new(vad_config.model_score_threshold)), vad_config),
            stopwords,
            mode: factory.mode,
        }
    }

    /// Feed one native-rate chunk through VAD (and stopword scoring, in
    /// `Stopwords` mode), drive the turn-taking engine, and drain any
    /// generator response into `sink`.
    pub(crate) async fn push(&mut self, native_chunk: &[i16], inputs: Vec<serde_json::Value>, sink: &mut dyn OutboundSink) {
        if let Some(detector) = self.stopwords.as_mut() {
            detector.push(native_chunk);
        }

        let Some((event, utterance)) = (match self.vad.push(native_chunk) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("vad scoring error: {e}");
                None
            }
        }) else {
            return;
        };

        if self.mode == TriggerMode::Stopwords && self.runtime.state().await == TurnState::Listening {
            if let Some(detector) = self.stopwords.as_mut() {
                match detector.check_match() {
                    Ok(Some(matched)) => {
                        if let Some(ctrl) = self.runtime.on_stopword_matched(matched).await {
                            sink.send_control(ctrl).await;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("stopword transcription error: {e}"),
                }
            }
        }

        let step = self.runtime.on_vad_event(event, utterance, inputs).await;
        for ctrl in step.controls {
            sink.send_control(ctrl).await;
        }
        if event == VadEvent::Paused {
            if let Some(detector) = self.stopwords.as_mut() {
                detector.reset();
            }
        }

        while self.runtime.state().await == TurnState::Responding {
            let step = self.runtime.drive_generator().await;
            if step.yields.is_empty() && step.controls.is_empty() {
                break;
            }
            for ctrl in step.controls {
                sink.send_control(ctrl).await;
            }
            for yielded in step.yields {
                match yielded {
                    Yield::Audio(frame) => sink.send_audio_frame(frame).await,
                    Yield::Extra(_) | Yield::Video(_) => {
                        sink.send_control(ControlMsg::warning(
                            "generator yielded a non-audio item on an audio-only transport",
                        ))
                        .await;
                    }
                }
            }
        }
    }
}

/// Run one outbound frame through the outbound codec and mu-law-encode each
/// resulting re-framed chunk.
fn emit_audio(frame: AudioFrame, codec: &mut AudioCodec, outbound_tx: &tokio::sync::mpsc::UnboundedSender<OutboundItem>) {
    match codec.process(&frame) {
        Ok((frames, _)) => {
            for out in frames {
                let mulaw_bytes = mulaw::encode(&out.samples);
                let _ = outbound_tx.send(OutboundItem::Media(mulaw_bytes));
            }
        }
        Err(e) => log::warn!("outbound codec error: {e}"),
    }
}

/// Drive one telephone-framed WebSocket connection end to end: admit a
/// session, route inbound mu-law audio through the Frame Codec into either
/// the raw handler or the turn-taking pipeline (per `options`), route
/// output back out as mu-law, forward control messages as JSON text frames —
/// all multiplexed onto the one outbound channel a single writer task owns.
pub async fn handle_connection(
    socket: WebSocket,
    session_manager: Arc<SessionManager>,
    handler_factory: impl Fn() -> Box<dyn Handler> + Send + 'static,
    inbound_queue_capacity: usize,
    options: ConnectionOptions,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<OutboundItem>();

    let send_task = tokio::spawn(async move {
        while let Some(item) = outbound_rx.recv().await {
            let message = match item {
                OutboundItem::Control(msg) => msg.to_json().ok().map(|json| Message::Text(json.into())),
                OutboundItem::Media(pcm_as_mulaw) => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(&pcm_as_mulaw);
                    serde_json::to_string(&OutboundEvent::Media { media: MediaPayload { payload: encoded } })
                        .ok()
                        .map(|json| Message::Text(json.into()))
                }
            };
            if let Some(message) = message {
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
        }
    });

    let session = match session_manager
        .create_session(None, handler_factory(), inbound_queue_capacity, options.phone_mode)
        .await
    {
        Ok(s) => s,
        Err(e) => {
            let _ = outbound_tx.send(OutboundItem::Control(ControlMsg::error(e.to_string())));
            drop(outbound_tx);
            let _ = send_task.await;
            return;
        }
    };
    session.set_state(crate::session::SessionState::Connected).await;

    let pipeline_properties = match &options.turn_taking {
        Some(factory) => factory.properties.clone(),
        None => session.handler.properties().await,
    };
    let mut inbound_codec = match AudioCodec::new(
        TELEPHONE_SAMPLE_RATE,
        pipeline_properties.input_sample_rate,
        pipeline_properties.expected_layout,
        if options.turn_taking.is_some() {
            ((pipeline_properties.input_sample_rate as f64) * 0.02) as usize
        } else {
            pipeline_properties.output_frame_samples
        },
    ) {
        Ok(codec) => codec,
        Err(e) => {
            let _ = outbound_tx.send(OutboundItem::Control(ControlMsg::error(e.to_string())));
            drop(outbound_tx);
            session_manager.remove_session(&session.id).await;
            let _ = send_task.await;
            return;
        }
    };
    let mut outbound_codec = match AudioCodec::new(
        pipeline_properties.output_sample_rate,
        TELEPHONE_SAMPLE_RATE,
        pipeline_properties.expected_layout,
        OUTBOUND_REFRAME_SAMPLES,
    ) {
        Ok(codec) => codec,
        Err(e) => {
            let _ = outbound_tx.send(OutboundItem::Control(ControlMsg::error(e.to_string())));
            drop(outbound_tx);
            session_manager.remove_session(&session.id).await;
            let _ = send_task.await;
            return;
        }
    };

    let mut turn_taking_pump = options
        .turn_taking
        .as_deref()
        .map(|factory| TurnTakingPump::new(factory, &options.vad, &options.stopword));

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<InboundEvent>(text.as_ref()) {
                Ok(InboundEvent::Start { .. }) => {
                    session.touch_inbound().await;
                }
                Ok(InboundEvent::Media { media }) => {
                    let Ok(raw) = base64::engine::general_purpose::STANDARD.decode(media.payload.as_bytes()) else {
                        continue;
                    };
                    let pcm = mulaw::decode(&raw);
                    session.touch_inbound().await;
                    session.set_state(crate::session::SessionState::Active).await;

                    let native_frames = match inbound_codec.process(&AudioFrame {
                        sample_rate: TELEPHONE_SAMPLE_RATE,
                        channels: 1,
                        samples: pcm,
                    }) {
                        Ok((frames, _)) => frames,
                        Err(e) => {
                            log::warn!("inbound codec error: {e}");
                            let _ = outbound_tx.send(OutboundItem::Control(ControlMsg::error(e.to_string())));
                            continue;
                        }
                    };

                    if let Some(pump) = turn_taking_pump.as_mut() {
                        for frame in native_frames {
                            let inputs = session.input_snapshot().await;
                            let mut sink = MulawSink { codec: &mut outbound_codec, tx: &outbound_tx };
                            pump.push(&frame.samples, inputs, &mut sink).await;
                        }
                        continue;
                    }

                    for frame in native_frames {
                        let overflowed = session.handler.enqueue(InboundFrame::Audio(frame)).await;
                        if overflowed {
                            let _ = outbound_tx.send(OutboundItem::Control(ControlMsg::warning("inbound audio queue overflowed")));
                        }
                    }
                    if let Err(e) = session.handler.pump_receive().await {
                        log::warn!("telephone bridge handler receive error: {e}");
                        let _ = outbound_tx.send(OutboundItem::Control(ControlMsg::error(e.to_string())));
                        continue;
                    }
                    while let Ok(Some(OutboundFrame::Audio(frame))) = session.handler.emit().await {
                        emit_audio(frame, &mut outbound_codec, &outbound_tx);
                    }
                }
                Ok(InboundEvent::Stop) => break,
                Err(e) => log::warn!("malformed telephone websocket frame: {e}"),
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                log::warn!("telephone websocket error: {e}");
                break;
            }
            _ => {}
        }
    }

    if let Some(frame) = outbound_codec.flush() {
        let mulaw_bytes = mulaw::encode(&frame.samples);
        let _ = outbound_tx.send(OutboundItem::Media(mulaw_bytes));
    }
    session.set_state(crate::session::SessionState::Draining).await;
    session_manager.remove_session(&session.id).await;
    drop(outbound_tx);
    let _ = send_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_event_parses_with_optional_id() {
        let parsed: InboundEvent = serde_json::from_str(r#"{"event":"start","websocket_id":"abc123"}"#).unwrap();
        assert!(matches!(parsed, InboundEvent::Start { websocket_id: Some(id) } if id == "abc123"));
    }

    #[test]
    fn media_event_carries_base64_payload() {
        let parsed: InboundEvent = serde_json::from_str(r#"{"event":"media","media":{"payload":"//8="}}"#).unwrap();
        assert!(matches!(parsed, InboundEvent::Media { .. }));
    }

    #[test]
    fn stop_event_has_no_fields() {
        let parsed: InboundEvent = serde_json::from_str(r#"{"event":"stop"}"#).unwrap();
        assert!(matches!(parsed, InboundEvent::Stop));
    }

    fn test_vad_config() -> VadConfig {
        VadConfig {
            audio_chunk_duration_secs: 0.1,
            started_talking_threshold_secs: 0.02,
            speech_threshold_secs: 0.01,
            native_sample_rate: 8_000,
            model_score_threshold: 0.1,
            ..VadConfig::default()
        }
    }

    /// Drives the exact pump `handle_connection` uses — VAD, turn-taking
    /// engine and outbound codec wired together, not a hand re-assembly of
    /// the pieces in isolation — across a loud-then-quiet utterance and
    /// checks both a control message and mu-law audio come out the other
    /// end.
    #[tokio::test]
    async fn turn_taking_pump_drives_vad_through_generator_to_mulaw_audio() {
        let factory = TurnTakingFactory {
            mode: TriggerMode::Pause,
            properties: HandlerProperties {
                input_sample_rate: 8_000,
                output_sample_rate: 8_000,
                output_frame_samples: 160,
                expected_layout: crate::config::ChannelLayout::Mono,
            },
            make_generator_factory: Box::new(crate::turn_taking::echo_generator_factory),
        };
        let mut pump = TurnTakingPump::new(&factory, &test_vad_config(), &StopwordConfig::default());
        let mut outbound_codec = AudioCodec::new(8_000, 8_000, crate::config::ChannelLayout::Mono, OUTBOUND_REFRAME_SAMPLES).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<OutboundItem>();

        let window_len = (8_000.0 * 0.1) as usize;
        let loud = vec![20_000i16; window_len];
        let quiet = vec![0i16; window_len];

        {
            let mut sink = MulawSink { codec: &mut outbound_codec, tx: &tx };
            pump.push(&loud, vec![], &mut sink).await;
        }
        {
            let mut sink = MulawSink { codec: &mut outbound_codec, tx: &tx };
            pump.push(&quiet, vec![], &mut sink).await;
        }

        let mut saw_pause_detected = false;
        let mut saw_media = false;
        while let Ok(item) = rx.try_recv() {
            match item {
                OutboundItem::Control(ControlMsg::PauseDetected) => saw_pause_detected = true,
                OutboundItem::Media(_) => saw_media = true,
                _ => {}
            }
        }
        assert!(saw_pause_detected, "expected a pause_detected control from the live pump");
        assert!(saw_media, "expected the echoed utterance to come back as mu-law media");
    }
}
