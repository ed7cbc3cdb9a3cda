//! Re-frames a stream of variable-length audio chunks into fixed-size
//! frames, carrying a partial tail across calls.

use std::collections::VecDeque;

pub struct Reframer {
    frame_samples: usize,
    channels: u16,
    sample_rate: u32,
    buffer: VecDeque<i16>,
}

impl Reframer {
    pub fn new(frame_samples: usize, channels: u16, sample_rate: u32) -> Self {
        Self {
            frame_samples,
            channels,
            sample_rate,
            buffer: VecDeque::new(),
        }
    }

    /// Push interleaved samples, draining as many complete frames as
    /// possible. The tail remains buffered for the next call.
    pub fn push(&mut self, interleaved: &[i16]) -> Vec<crate::frame::AudioFrame> {
        self.buffer.extend(interleaved.iter().copied());
        self.drain_complete()
    }

    fn drain_complete(&mut self) -> Vec<crate::frame::AudioFrame> {
        let frame_len = self.frame_samples * self.channels as usize;
        let mut out = Vec::new();
        while self.buffer.len() >= frame_len {
            let samples: Vec<i16> = self.buffer.drain(..frame_len).collect();
            out.push(crate::frame::AudioFrame {
                sample_rate: self.sample_rate,
                channels: self.channels,
                samples,
            });
        }
        out
    }

    /// Pad the remaining tail with zeros and flush it as a final frame.
    /// Called once at session end; returns `None` if there is no tail.
    pub fn flush(&mut self) -> Option<crate::frame::AudioFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let frame_len = self.frame_samples * self.channels as usize;
        let mut samples: Vec<i16> = self.buffer.drain(..).collect();
        samples.resize(frame_len, 0);
        Some(crate::frame::AudioFrame {
            sample_rate: self.sample_rate,
            channels: self.channels,
            samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_partial_tail_across_pushes() {
        let mut reframer = Reframer::new(10, 1, 16_000);
        assert!(reframer.push(&[0; 6]).is_empty());
        let frames = reframer.push(&[0; 6]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples.len(), 10);
    }

    #[test]
    fn flush_zero_pads_tail() {
        let mut reframer = Reframer::new(10, 1, 16_000);
        reframer.push(&[1, 2, 3]);
        let flushed = reframer.flush().expect("tail present");
        assert_eq!(flushed.samples, vec![1, 2, 3, 0, 0, 0, 0, 0, 0, 0]);
        assert!(reframer.flush().is_none());
    }

    #[test]
    fn stereo_frame_length_accounts_for_channels() {
        let mut reframer = Reframer::new(4, 2, 48_000);
        let frames = reframer.push(&[0; 8]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples.len(), 8);
    }
}
