//! Frame Codec: resamples, mixes channels, and re-frames audio
//! between peer-negotiated parameters and handler-declared parameters.
//! Video passes through unchanged apart from pixel-layout conversion.

pub mod mulaw;
mod reframe;
mod resample;

use crate::config::ChannelLayout;
use crate::error::CodecError;
use crate::frame::{AudioFrame, PixelLayout, VideoFrame};
use reframe::Reframer;
use resample::RateConverter;

/// Per-session, per-direction audio codec. A session holds two (inbound and
/// outbound); each is independent, matching the "resampler state is
/// per-direction and per-session" requirement.
pub struct AudioCodec {
    input_rate: u32,
    output_rate: u32,
    declared_layout: ChannelLayout,
    converters: Vec<RateConverter>,
    reframer: Reframer,
}

const RESAMPLE_CHUNK_SAMPLES: usize = 160;

impl AudioCodec {
    pub fn new(
        input_rate: u32,
        output_rate: u32,
        declared_layout: ChannelLayout,
        output_frame_samples: usize,
    ) -> Result<Self, CodecError> {
        let channel_count = match declared_layout {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        };
        let converters = (0..channel_count)
            .map(|_| RateConverter::new(input_rate, output_rate, RESAMPLE_CHUNK_SAMPLES))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            input_rate,
            output_rate,
            declared_layout,
            converters,
            reframer: Reframer::new(output_frame_samples, channel_count, output_rate),
        })
    }

    /// Process one inbound frame, re-initialising resampler state and
    /// returning a `warning` marker if the frame's rate differs from the
    /// rate this codec was built for (a rare mid-session renegotiation).
    pub fn process(&mut self, frame: &AudioFrame) -> Result<(Vec<AudioFrame>, bool), CodecError> {
        let mut rate_changed = false;
        if frame.sample_rate != self.input_rate {
            log::warn!(
                "inbound sample rate changed {} -> {}; reinitialising codec state",
                self.input_rate,
                frame.sample_rate
            );
            self.input_rate = frame.sample_rate;
            let channel_count = self.converters.len();
            self.converters = (0..channel_count)
                .map(|_| RateConverter::new(self.input_rate, self.output_rate, RESAMPLE_CHUNK_SAMPLES))
                .collect::<Result<Vec<_>, _>>()?;
            rate_changed = true;
        }

        let declared_channels = match self.declared_layout {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        };
        if frame.channels == 0 {
            return Err(CodecError::ChannelMismatch {
                expected: self.declared_layout,
                actual: frame.channels,
            });
        }

        let mono_or_stereo = remix_channels(frame, declared_channels);

        let mut per_channel_out: Vec<Vec<i16>> = Vec::with_capacity(declared_channels as usize);
        for (ch, converter) in self.converters.iter_mut().enumerate() {
            let channel_samples: Vec<i16> = mono_or_stereo
                .iter()
                .skip(ch)
                .step_by(declared_channels as usize)
                .copied()
                .collect();
            per_channel_out.push(converter.process(&channel_samples));
        }

        let interleaved = interleave(&per_channel_out);
        let frames = self.reframer.push(&interleaved);
        Ok((frames, rate_changed))
    }

    /// Flush the re-framer's tail at session end.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        self.reframer.flush()
    }
}

/// Down-mix stereo→mono by averaging, or up-mix mono→stereo by duplication.
fn remix_channels(frame: &AudioFrame, declared_channels: u16) -> Vec<i16> {
    if frame.channels == declared_channels {
        return frame.samples.clone();
    }
    match (frame.channels, declared_channels) {
        (2, 1) => frame
            .samples
            .chunks(2)
            .map(|pair| {
                let l = pair[0] as i32;
                let r = pair.get(1).copied().unwrap_or(0) as i32;
                ((l + r) / 2) as i16
            })
            .collect(),
        (1, 2) => frame.samples.iter().flat_map(|&s| [s, s]).collect(),
        _ => frame.samples.clone(),
    }
}

fn interleave(per_channel: &[Vec<i16>]) -> Vec<i16> {
    if per_channel.is_empty() {
        return Vec::new();
    }
    let len = per_channel.iter().map(|c| c.len()).min().unwrap_or(0);
    let mut out = Vec::with_capacity(len * per_channel.len());
    for i in 0..len {
        for channel in per_channel {
            out.push(channel[i]);
        }
    }
    out
}

/// Video has no resize contract, only pixel-layout conversion.
pub fn convert_video(frame: &VideoFrame, target: PixelLayout) -> VideoFrame {
    if frame.pixel_layout == target {
        return frame.clone();
    }
    let pixels = match (frame.pixel_layout, target) {
        (PixelLayout::Rgb24, PixelLayout::Bgr24) | (PixelLayout::Bgr24, PixelLayout::Rgb24) => {
            frame
                .pixels
                .chunks(3)
                .flat_map(|rgb| [rgb[2], rgb[1], rgb[0]])
                .collect()
        }
        _ => frame.pixels.clone(),
    };
    VideoFrame {
        width: frame.width,
        height: frame.height,
        pixel_layout: target,
        pixels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_passthrough_same_rate_reframes_exactly() {
        let mut codec = AudioCodec::new(16_000, 16_000, ChannelLayout::Mono, 160).unwrap();
        let frame = AudioFrame {
            sample_rate: 16_000,
            channels: 1,
            samples: vec![1i16; 160],
        };
        let (frames, changed) = codec.process(&frame).unwrap();
        assert!(!changed);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples, vec![1i16; 160]);
    }

    #[test]
    fn stereo_to_mono_downmix_averages() {
        let mut codec = AudioCodec::new(16_000, 16_000, ChannelLayout::Mono, 4).unwrap();
        let frame = AudioFrame {
            sample_rate: 16_000,
            channels: 2,
            samples: vec![10, 20, 30, 40, 10, 20, 30, 40],
        };
        let (frames, _) = codec.process(&frame).unwrap();
        assert_eq!(frames[0].samples, vec![15, 35, 15, 35]);
    }

    #[test]
    fn rate_change_between_frames_marks_reinitialised() {
        let mut codec = AudioCodec::new(16_000, 16_000, ChannelLayout::Mono, 160).unwrap();
        let frame_a = AudioFrame {
            sample_rate: 16_000,
            channels: 1,
            samples: vec![0i16; 160],
        };
        let frame_b = AudioFrame {
            sample_rate: 8_000,
            channels: 1,
            samples: vec![0i16; 80],
        };
        let (_, changed_a) = codec.process(&frame_a).unwrap();
        let (_, changed_b) = codec.process(&frame_b).unwrap();
        assert!(!changed_a);
        assert!(changed_b);
    }

    #[test]
    fn zero_channel_frame_is_rejected() {
        let mut codec = AudioCodec::new(16_000, 16_000, ChannelLayout::Mono, 160).unwrap();
        let frame = AudioFrame {
            sample_rate: 16_000,
            channels: 0,
            samples: vec![],
        };
        assert!(codec.process(&frame).is_err());
    }

    #[test]
    fn video_passthrough_preserves_identical_layout() {
        let frame = VideoFrame {
            width: 4,
            height: 4,
            pixel_layout: PixelLayout::Yuv420,
            pixels: vec![1, 2, 3],
        };
        let converted = convert_video(&frame, PixelLayout::Yuv420);
        assert_eq!(converted.pixels, frame.pixels);
    }

    #[test]
    fn rgb_bgr_conversion_swaps_byte_order() {
        let frame = VideoFrame {
            width: 1,
            height: 1,
            pixel_layout: PixelLayout::Rgb24,
            pixels: vec![1, 2, 3],
        };
        let converted = convert_video(&frame, PixelLayout::Bgr24);
        assert_eq!(converted.pixels, vec![3, 2, 1]);
    }
}
