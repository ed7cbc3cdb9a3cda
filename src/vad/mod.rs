//! VAD Gate: chunked speech-activity scoring over an inbound
//! audio stream, emitting `STARTED_TALKING` / `CONTINUING` / `PAUSED`.
//!
//! Built on the buffer-then-score-fixed-frames shape used for voice
//! activity detection elsewhere in this corpus, generalized from a binary
//! speech/silence flag into a windowed start/continue/pause state machine.
//! The scoring model itself is pluggable (`VadModel`); [`EnergyVadModel`]
//! is the dependency-free default.

use crate::error::VadError;
use crate::frame::AudioFrame;

/// Per-frame speech/non-speech scorer. Implementations may wrap an external
/// ML model; the crate ships [`EnergyVadModel`] so it builds and runs with
/// no ML dependency.
pub trait VadModel: Send {
    /// Score one native-rate frame (typically 20-30ms); `true` = speech.
    fn is_speech(&mut self, frame: &[i16], sample_rate: u32) -> Result<bool, VadError>;
}

/// Energy + zero-crossing-rate scorer. Not a model of record for production
/// accuracy — a working, dependency-free default behind the same seam an
/// external model would occupy.
pub struct EnergyVadModel {
    threshold: f32,
}

impl EnergyVadModel {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl VadModel for EnergyVadModel {
    fn is_speech(&mut self, frame: &[i16], _sample_rate: u32) -> Result<bool, VadError> {
        if frame.is_empty() {
            return Ok(false);
        }
        let rms = {
            let sum_sq: f64 = frame.iter().map(|&s| (s as f64).powi(2)).sum();
            (sum_sq / frame.len() as f64).sqrt() / 32768.0
        };
        Ok(rms as f32 >= self.threshold)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    StartedTalking,
    Continuing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Speaking,
}

/// Drives the idle/speaking/paused state machine over a continuous stream
/// of native-rate PCM.
pub struct VadGate {
    model: Box<dyn VadModel>,
    native_sample_rate: u32,
    chunk_duration_secs: f64,
    started_talking_threshold_secs: f64,
    speech_threshold_secs: f64,
    scoring_frame_samples: usize,
    state: State,
    /// Samples accumulated in the current scoring window.
    window_buffer: Vec<i16>,
    /// Samples retained since the utterance began talking.
    utterance_buffer: Vec<i16>,
}

impl VadGate {
    pub fn new(model: Box<dyn VadModel>, config: &crate::config::VadConfig) -> Self {
        let scoring_frame_samples = ((config.native_sample_rate as f64) * 0.02) as usize;
        Self {
            model,
            native_sample_rate: config.native_sample_rate,
            chunk_duration_secs: config.audio_chunk_duration_secs,
            started_talking_threshold_secs: config.started_talking_threshold_secs,
            speech_threshold_secs: config.speech_threshold_secs,
            scoring_frame_samples: scoring_frame_samples.max(1),
            state: State::Idle,
            window_buffer: Vec::new(),
            utterance_buffer: Vec::new(),
        }
    }

    /// Feed native-rate mono PCM. Returns an event whenever a full
    /// `audio_chunk_duration` window has been scored; `None` mid-window.
    /// On `Paused`, the returned utterance audio is drained and reset.
    pub fn push(&mut self, samples: &[i16]) -> Result<Option<(VadEvent, Option<AudioFrame>)>, VadError> {
        self.window_buffer.extend_from_slice(samples);
        if self.state == State::Speaking {
            self.utterance_buffer.extend_from_slice(samples);
        }

        let window_target = ((self.native_sample_rate as f64) * self.chunk_duration_secs) as usize;
        if self.window_buffer.len() < window_target {
            return Ok(None);
        }

        let window: Vec<i16> = self.window_buffer.drain(..window_target).collect();
        let speech_secs = self.score_window(&window)?;

        let event = match self.state {
            State::Idle => {
                if speech_secs > self.started_talking_threshold_secs {
                    self.state = State::Speaking;
                    self.utterance_buffer = window.clone();
                    VadEvent::StartedTalking
                } else {
                    return Ok(None);
                }
            }
            State::Speaking => {
                if speech_secs <= self.speech_threshold_secs {
                    self.state = State::Idle;
                    let utterance = std::mem::take(&mut self.utterance_buffer);
                    let frame = AudioFrame {
                        sample_rate: self.native_sample_rate,
                        channels: 1,
                        samples: utterance,
                    };
                    return Ok(Some((VadEvent::Paused, Some(frame))));
                }
                VadEvent::Continuing
            }
        };

        Ok(Some((event, None)))
    }

    fn score_window(&mut self, window: &[i16]) -> Result<f64, VadError> {
        let mut speech_frames = 0usize;
        let mut total_frames = 0usize;
        for chunk in window.chunks(self.scoring_frame_samples) {
            total_frames += 1;
            if self.model.is_speech(chunk, self.native_sample_rate)? {
                speech_frames += 1;
            }
        }
        if total_frames == 0 {
            return Ok(0.0);
        }
        let frame_secs = self.scoring_frame_samples as f64 / self.native_sample_rate as f64;
        Ok(speech_frames as f64 * frame_secs)
    }

    pub fn is_speaking(&self) -> bool {
        self.state == State::Speaking
    }

    /// Reset state, e.g. after barge-in hands the utterance to a new turn.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.window_buffer.clear();
        self.utterance_buffer.clear();
    }
}
