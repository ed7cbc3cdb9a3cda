//! WebRTC signalling: SDP offer/answer, ICE server construction including
//! TURN credential minting, admission against the session manager.
//!
//! Narrowed from video-transceiver/H264-VP8-VP9 plumbing to audio-first,
//! modality/mode-driven transceiver setup.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Channels, SampleRate};
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tokio::sync::RwLock;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::codec::AudioCodec;
use crate::config::{IceServerConfig, Modality, RtcConfig, SessionMode};
use crate::control::ControlMsg;
use crate::error::SignallingError;
use crate::frame::AudioFrame;
use crate::handler::{HandlerProperties, InboundFrame, OutboundFrame};
use crate::session::{Session, SessionManager, SessionState};

use super::websocket::{ConnectionOptions, OutboundSink, TurnTakingPump};

/// Opus is negotiated at a fixed 48 kHz/stereo regardless of what the
/// handler/generator declares natively; the Frame Codec bridges the two the
/// same way it bridges the telephone bridge's 8 kHz mu-law.
const OPUS_SAMPLE_RATE: u32 = 48_000;
const OPUS_CHANNELS: u16 = 2;
/// 20ms at 48 kHz, the frame size `TrackLocalStaticSample` and most Opus
/// encoders/decoders are tuned for.
const OPUS_FRAME_SAMPLES_PER_CHANNEL: usize = 960;

/// Build the effective ICE server list, minting a TURN credential via
/// HMAC-SHA1 when `turn_shared_secret` is configured.
pub fn build_ice_servers(config: &RtcConfig) -> Vec<IceServerConfig> {
    let mut servers = Vec::new();

    if !config.stun_host.is_empty() && config.stun_port != 0 {
        servers.push(IceServerConfig {
            urls: vec![format!("stun:{}:{}", config.stun_host, config.stun_port)],
            username: None,
            credential: None,
        });
    }

    if !config.turn_host.is_empty() {
        let scheme = if config.turn_tls { "turns" } else { "turn" };
        let transport = if config.turn_protocol.is_empty() { "udp" } else { config.turn_protocol.as_str() };
        let url = format!("{scheme}:{}:{}?transport={transport}", config.turn_host, config.turn_port);

        let (username, credential) = if !config.turn_shared_secret.is_empty() {
            let ttl_secs: u64 = 24 * 60 * 60;
            let expiry = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() + ttl_secs)
                .unwrap_or(ttl_secs);
            let user = format!("{expiry}:turn-client");
            let password = hmac_sha1_base64(&config.turn_shared_secret, &user);
            (Some(user), Some(password))
        } else if !config.turn_username.is_empty() {
            (Some(config.turn_username.clone()), Some(config.turn_password.clone()))
        } else {
            (None, None)
        };

        servers.push(IceServerConfig { urls: vec![url], username, credential });
    }

    if servers.is_empty() {
        return config.ice_servers.clone();
    }
    servers
}

fn hmac_sha1_base64(secret: &str, message: &str) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| Hmac::<Sha1>::new_from_slice(&[]).unwrap());
    mac.update(message.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Builds peer connections with the codec/ICE setup this server needs:
/// Opus audio, one transceiver whose direction follows the session's
/// configured `mode`.
pub struct PeerConnectionFactory {
    rtc: RtcConfig,
}

impl PeerConnectionFactory {
    pub fn new(rtc: RtcConfig) -> Self {
        Self { rtc }
    }

    pub async fn create(&self, modality: Modality, mode: SessionMode) -> Result<Arc<RTCPeerConnection>, SignallingError> {
        let mut media_engine = MediaEngine::default();
        if modality != Modality::Video {
            media_engine
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: RTCRtpCodecCapability {
                            mime_type: MIME_TYPE_OPUS.to_string(),
                            clock_rate: 48_000,
                            channels: 2,
                            sdp_fmtp_line: String::new(),
                            rtcp_feedback: vec![],
                        },
                        payload_type: 111,
                        ..Default::default()
                    },
                    RTPCodecType::Audio,
                )
                .map_err(|e| SignallingError::NegotiationFailed(e.to_string()))?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SignallingError::NegotiationFailed(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(SettingEngine::default())
            .build();

        let ice_servers = build_ice_servers(&self.rtc)
            .into_iter()
            .map(|s| RTCIceServer {
                urls: s.urls,
                username: s.username.unwrap_or_default(),
                credential: s.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let peer_connection = api
            .new_peer_connection(RTCConfiguration { ice_servers, ..Default::default() })
            .await
            .map_err(|e| SignallingError::NegotiationFailed(e.to_string()))?;

        let direction = match mode {
            SessionMode::SendReceive => RTCRtpTransceiverDirection::Sendrecv,
            SessionMode::Send => RTCRtpTransceiverDirection::Recvonly,
            SessionMode::Receive => RTCRtpTransceiverDirection::Sendonly,
        };
        if modality != Modality::Video {
            peer_connection
                .add_transceiver_from_kind(
                    webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio,
                    Some(RTCRtpTransceiverInit { direction, send_encodings: vec![] }),
                )
                .await
                .map_err(|e| SignallingError::NegotiationFailed(e.to_string()))?;
        }

        Ok(Arc::new(peer_connection))
    }

    /// Outbound audio track added to the connection for `send-receive`/`receive`
    /// sessions. Samples are pushed by the outbound pump via [`TrackLocalStaticSample`].
    pub fn create_outbound_audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            "audio".to_string(),
            "turn-taking-server".to_string(),
        ))
    }
}

/// Answer an SDP offer, waiting for ICE gathering to complete within
/// `negotiation_timeout`; a caller that times out should emit
/// `connection_timeout` and close the session.
pub async fn answer_offer(
    peer_connection: &Arc<RTCPeerConnection>,
    offer_sdp: &str,
    negotiation_timeout: Duration,
) -> Result<String, SignallingError> {
    let offer = RTCSessionDescription::offer(offer_sdp.to_string())
        .map_err(|e| SignallingError::MalformedOffer(e.to_string()))?;

    peer_connection
        .set_remote_description(offer)
        .await
        .map_err(|e| SignallingError::NegotiationFailed(e.to_string()))?;

    let answer = peer_connection
        .create_answer(None)
        .await
        .map_err(|e| SignallingError::NegotiationFailed(e.to_string()))?;

    let mut gather_complete = peer_connection.gathering_complete_promise().await;
    peer_connection
        .set_local_description(answer.clone())
        .await
        .map_err(|e| SignallingError::NegotiationFailed(e.to_string()))?;

    tokio::time::timeout(negotiation_timeout, gather_complete.recv())
        .await
        .map_err(|_| SignallingError::ConnectionTimeout)?;

    match peer_connection.local_description().await {
        Some(desc) => Ok(desc.sdp),
        None => Ok(answer.sdp),
    }
}

pub async fn add_ice_candidate(
    peer_connection: &Arc<RTCPeerConnection>,
    candidate: &str,
    sdp_mid: Option<&str>,
    sdp_mline_index: Option<u16>,
) -> Result<(), SignallingError> {
    let candidate_init = RTCIceCandidateInit {
        candidate: candidate.to_string(),
        sdp_mid: sdp_mid.map(|s| s.to_string()),
        sdp_mline_index,
        username_fragment: None,
    };
    peer_connection
        .add_ice_candidate(candidate_init)
        .await
        .map_err(|e| SignallingError::NegotiationFailed(e.to_string()))
}

/// Replace the audio transceiver's outbound track with `track`, unless the
/// session is `Send`-only (server never transmits audio in that mode).
pub async fn attach_outbound_track(
    peer_connection: &Arc<RTCPeerConnection>,
    mode: SessionMode,
    track: Arc<TrackLocalStaticSample>,
) -> Result<(), SignallingError> {
    if mode == SessionMode::Send {
        return Ok(());
    }
    for transceiver in peer_connection.get_transceivers().await {
        if transceiver.kind() == RTPCodecType::Audio {
            let sender = transceiver.sender().await;
            sender
                .replace_track(Some(track as Arc<dyn TrackLocal + Send + Sync>))
                .await
                .map_err(|e| SignallingError::NegotiationFailed(e.to_string()))?;
            return Ok(());
        }
    }
    Err(SignallingError::NegotiationFailed(
        "no audio transceiver to attach the outbound track to".to_string(),
    ))
}

/// Wire `on_track` (inbound RTP -> Opus decode -> Frame Codec -> raw handler
/// or turn-taking pipeline -> Frame Codec -> Opus encode -> outbound track)
/// and `on_data_channel` (the `"text"` control channel) onto a negotiated
/// peer connection. Mirrors the WebSocket/telephone bridge's pipeline
/// selection, just driven by RTP instead of a JSON media frame.
pub fn attach_audio_bridge(
    peer_connection: &Arc<RTCPeerConnection>,
    outbound_track: Arc<TrackLocalStaticSample>,
    session: Arc<Session>,
    session_manager: Arc<SessionManager>,
    options: ConnectionOptions,
) {
    let control_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>> = Arc::new(RwLock::new(None));

    {
        let session = session.clone();
        let session_manager = session_manager.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let session = session.clone();
            let session_manager = session_manager.clone();
            Box::pin(async move {
                if matches!(
                    state,
                    webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState::Failed
                        | webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState::Closed
                ) {
                    session.set_state(SessionState::Draining).await;
                    session_manager.remove_session(&session.id).await;
                }
            })
        }));
    }

    {
        let control_channel = control_channel.clone();
        peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let control_channel = control_channel.clone();
            Box::pin(async move {
                if dc.label() == "text" {
                    *control_channel.write().await = Some(dc);
                }
            })
        }));
    }

    peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
        let session = session.clone();
        let session_manager = session_manager.clone();
        let options = options.clone();
        let outbound_track = outbound_track.clone();
        let control_channel = control_channel.clone();
        Box::pin(async move {
            if track.kind() != RTPCodecType::Audio {
                return;
            }
            tokio::spawn(run_inbound_track(track, session, session_manager, options, outbound_track, control_channel));
        })
    }));
}

/// Reads RTP off `track` until the remote side ends it, driving the same
/// pipeline selection `websocket::handle_connection` does.
async fn run_inbound_track(
    track: Arc<TrackRemote>,
    session: Arc<Session>,
    session_manager: Arc<SessionManager>,
    options: ConnectionOptions,
    outbound_track: Arc<TrackLocalStaticSample>,
    control_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
) {
    let pipeline_properties: HandlerProperties = match &options.turn_taking {
        Some(factory) => factory.properties.clone(),
        None => session.handler.properties().await,
    };

    let mut decoder = match OpusDecoder::new(SampleRate::Hz48000, Channels::Stereo) {
        Ok(d) => d,
        Err(e) => {
            log::warn!("failed to construct opus decoder: {e}");
            return;
        }
    };
    let mut encoder = match OpusEncoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Voip) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("failed to construct opus encoder: {e}");
            return;
        }
    };

    let mut inbound_codec = match AudioCodec::new(
        OPUS_SAMPLE_RATE,
        pipeline_properties.input_sample_rate,
        pipeline_properties.expected_layout,
        if options.turn_taking.is_some() {
            ((pipeline_properties.input_sample_rate as f64) * 0.02) as usize
        } else {
            pipeline_properties.output_frame_samples
        },
    ) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("webrtc inbound codec build failed: {e}");
            return;
        }
    };
    let mut outbound_codec = match AudioCodec::new(
        pipeline_properties.output_sample_rate,
        OPUS_SAMPLE_RATE,
        pipeline_properties.expected_layout,
        OPUS_FRAME_SAMPLES_PER_CHANNEL,
    ) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("webrtc outbound codec build failed: {e}");
            return;
        }
    };

    let mut turn_taking_pump = options
        .turn_taking
        .as_deref()
        .map(|factory| TurnTakingPump::new(factory, &options.vad, &options.stopword));

    // Largest plausible decode for a single Opus packet at this rate: well
    // above the nominal 960 samples/channel so a rare larger frame doesn't
    // truncate.
    let mut pcm_buf = vec![0i16; OPUS_FRAME_SAMPLES_PER_CHANNEL * OPUS_CHANNELS as usize * 4];

    loop {
        let (packet, _attrs) = match track.read_rtp().await {
            Ok(v) => v,
            Err(_) => break,
        };
        session.touch_inbound().await;
        session.set_state(SessionState::Active).await;

        let decoded_per_channel = match decoder.decode(Some(packet.payload.as_ref()), &mut pcm_buf, false) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("opus decode error: {e}");
                continue;
            }
        };
        let frame = AudioFrame {
            sample_rate: OPUS_SAMPLE_RATE,
            channels: OPUS_CHANNELS,
            samples: pcm_buf[..decoded_per_channel * OPUS_CHANNELS as usize].to_vec(),
        };

        let native_frames = match inbound_codec.process(&frame) {
            Ok((frames, _)) => frames,
            Err(e) => {
                log::warn!("webrtc inbound codec error: {e}");
                continue;
            }
        };

        if let Some(pump) = turn_taking_pump.as_mut() {
            for native in native_frames {
                let inputs = session.input_snapshot().await;
                let mut sink = OpusRtpSink {
                    codec: &mut outbound_codec,
                    encoder: &mut encoder,
                    track: &outbound_track,
                    control: &control_channel,
                };
                pump.push(&native.samples, inputs, &mut sink).await;
            }
            continue;
        }

        for native in native_frames {
            let overflowed = session.handler.enqueue(InboundFrame::Audio(native)).await;
            if overflowed {
                send_control(&control_channel, ControlMsg::warning("inbound audio queue overflowed")).await;
            }
        }
        if let Err(e) = session.handler.pump_receive().await {
            log::warn!("webrtc handler receive error: {e}");
            send_control(&control_channel, ControlMsg::error(e.to_string())).await;
            continue;
        }
        while let Ok(Some(OutboundFrame::Audio(out_frame))) = session.handler.emit().await {
            match outbound_codec.process(&out_frame) {
                Ok((frames, _)) => {
                    for framed in frames {
                        encode_and_write(&mut encoder, &outbound_track, &framed).await;
                    }
                }
                Err(e) => log::warn!("webrtc outbound codec error: {e}"),
            }
        }
    }

    if let Some(tail) = outbound_codec.flush() {
        encode_and_write(&mut encoder, &outbound_track, &tail).await;
    }
    session.set_state(SessionState::Draining).await;
    session_manager.remove_session(&session.id).await;
}

/// Delivers turn-taking pump output onto the negotiated Opus track and the
/// `"text"` data channel, mirroring [`super::websocket::MulawSink`] for the
/// WebRTC transport.
struct OpusRtpSink<'a> {
    codec: &'a mut AudioCodec,
    encoder: &'a mut OpusEncoder,
    track: &'a Arc<TrackLocalStaticSample>,
    control: &'a Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
}

#[async_trait::async_trait]
impl OutboundSink for OpusRtpSink<'_> {
    async fn send_control(&mut self, msg: ControlMsg) {
        send_control(self.control, msg).await;
    }

    async fn send_audio_frame(&mut self, frame: AudioFrame) {
        match self.codec.process(&frame) {
            Ok((frames, _)) => {
                for out in frames {
                    encode_and_write(self.encoder, self.track, &out).await;
                }
            }
            Err(e) => log::warn!("webrtc outbound codec error: {e}"),
        }
    }
}

async fn send_control(control: &Arc<RwLock<Option<Arc<RTCDataChannel>>>>, msg: ControlMsg) {
    let channel = control.read().await.clone();
    let Some(dc) = channel else { return };
    if dc.ready_state() != RTCDataChannelState::Open {
        return;
    }
    match msg.to_json() {
        Ok(json) => {
            if let Err(e) = dc.send(&Bytes::from(json)).await {
                log::warn!("control data channel send failed: {e}");
            }
        }
        Err(e) => log::warn!("failed to serialize control message: {e}"),
    }
}

/// Opus-encode one already re-framed/resampled outbound frame and push it as
/// one RTP sample.
async fn encode_and_write(encoder: &mut OpusEncoder, track: &Arc<TrackLocalStaticSample>, frame: &AudioFrame) {
    let mut buf = vec![0u8; 4000];
    match encoder.encode(&frame.samples, &mut buf) {
        Ok(len) => {
            let sample = Sample {
                data: Bytes::copy_from_slice(&buf[..len]),
                duration: Duration::from_millis(20),
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                log::warn!("failed to write outbound opus sample: {e}");
            }
        }
        Err(e) => log::warn!("opus encode error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_ice_servers_uses_explicit_list_when_no_stun_or_turn_configured() {
        let config = RtcConfig {
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:example.com:3478".to_string()],
                username: None,
                credential: None,
            }],
            ..RtcConfig::default()
        };
        let servers = build_ice_servers(&config);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls[0], "stun:example.com:3478");
    }

    #[test]
    fn build_ice_servers_mints_turn_credential_from_shared_secret() {
        let config = RtcConfig {
            turn_host: "turn.example.com".to_string(),
            turn_shared_secret: "sekrit".to_string(),
            ..RtcConfig::default()
        };
        let servers = build_ice_servers(&config);
        let turn = servers.iter().find(|s| s.urls[0].starts_with("turn:")).unwrap();
        assert!(turn.username.is_some());
        assert!(turn.credential.is_some());
    }

    #[test]
    fn hmac_is_deterministic_for_same_inputs() {
        let a = hmac_sha1_base64("secret", "1234:user");
        let b = hmac_sha1_base64("secret", "1234:user");
        assert_eq!(a, b);
    }
}
