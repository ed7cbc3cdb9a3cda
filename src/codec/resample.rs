//! Sample-rate conversion for a single direction of a single session.
//!
//! Grounded on the band-limited polyphase resampler pattern used for
//! capture-rate-to-model-rate conversion elsewhere in this corpus: a
//! `rubato` resampler processes fixed-size chunks, excess input samples are
//! accumulated between calls, and same-rate sessions take a zero-copy
//! passthrough path rather than paying for an identity resampler.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::error::CodecError;

/// Converts `i16` PCM from one fixed sample rate to another, one channel at
/// a time. Holds resampler state across calls so successive frames do not
/// click at the boundary.
pub struct RateConverter {
    resampler: Option<FastFixedIn<f32>>,
    chunk_size: usize,
    input_buf: Vec<f32>,
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    pub fn new(input_rate: u32, output_rate: u32, chunk_size: usize) -> Result<Self, CodecError> {
        if input_rate == output_rate {
            return Ok(Self {
                resampler: None,
                chunk_size,
                input_buf: Vec::new(),
                output_buf: Vec::new(),
            });
        }

        let ratio = output_rate as f64 / input_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| CodecError::ResamplerInit(e.to_string()))?;
        let max_out = resampler.output_frames_max();

        Ok(Self {
            resampler: Some(resampler),
            chunk_size,
            input_buf: Vec::new(),
            output_buf: vec![vec![0f32; max_out]; 1],
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Feed `i16` samples for one channel; returns resampled `i16` output
    /// (may be shorter than the input, or empty while input accumulates).
    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf
            .extend(samples.iter().map(|&s| s as f32 / 32768.0));

        let mut out = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    out.extend(
                        self.output_buf[0][..produced]
                            .iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16),
                    );
                }
                Err(e) => {
                    log::warn!("resampler process error: {e}");
                }
            }
            self.input_buf.drain(..self.chunk_size);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 160).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<i16> = (0..320).map(|i| i as i16).collect();
        assert_eq!(rc.process(&samples), samples);
    }

    #[test]
    fn upsample_roundtrip_preserves_rms_within_one_percent() {
        let sine: Vec<i16> = (0..16_000)
            .map(|i| ((i as f64 * 440.0 * std::f64::consts::TAU / 16_000.0).sin() * 8000.0) as i16)
            .collect();

        let mut up = RateConverter::new(16_000, 48_000, 160).unwrap();
        let mut upsampled = Vec::new();
        for chunk in sine.chunks(160) {
            upsampled.extend(up.process(chunk));
        }

        let mut down = RateConverter::new(48_000, 16_000, 480).unwrap();
        let mut roundtripped = Vec::new();
        for chunk in upsampled.chunks(480) {
            roundtripped.extend(down.process(chunk));
        }

        let rms = |samples: &[i16]| -> f64 {
            if samples.is_empty() {
                return 0.0;
            }
            let sum_sq: f64 = samples.iter().map(|&s| (s as f64).powi(2)).sum();
            (sum_sq / samples.len() as f64).sqrt()
        };

        let original_rms = rms(&sine[..roundtripped.len().min(sine.len())]);
        let roundtrip_rms = rms(&roundtripped);
        if original_rms > 0.0 {
            let relative_error = (roundtrip_rms - original_rms).abs() / original_rms;
            assert!(
                relative_error < 0.01,
                "rms drifted too far: original={original_rms} roundtrip={roundtrip_rms}"
            );
        }
    }
}
