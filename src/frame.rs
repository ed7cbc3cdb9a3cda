//! Shared media types carried across the codec, handler runtime, and
//! turn-taking engine.

use serde::Serialize;

/// PCM audio, always `int16`, `channels` interleaved per `samples`.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples, length = `samples_per_channel * channels`.
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn samples_per_channel(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn silence(sample_rate: u32, channels: u16, samples_per_channel: usize) -> Self {
        Self {
            sample_rate,
            channels,
            samples: vec![0i16; samples_per_channel * channels as usize],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelLayout {
    Rgb24,
    Bgr24,
    Yuv420,
}

#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub pixel_layout: PixelLayout,
    pub pixels: Vec<u8>,
}

/// Opaque payload emitted by a handler/generator alongside media frames.
/// Delivered through the output hook; announced on the control channel as
/// `fetch_output`.
#[derive(Debug, Clone, Serialize)]
pub struct AdditionalOutputs(pub serde_json::Value);

/// Tagged variant at the generator/runtime boundary, standing in for the
/// heterogeneous audio/video/extra values a generator can yield.
#[derive(Debug, Clone)]
pub enum Yield {
    Audio(AudioFrame),
    Video(VideoFrame),
    Extra(AdditionalOutputs),
}
