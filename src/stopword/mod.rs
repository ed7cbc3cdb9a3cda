//! Stopword Detector: lightweight STT over a bounded ring
//! buffer of recent speech, normalized token matching against a configured
//! word list.
//!
//! Grounded on the per-session ring-buffer-of-recent-audio pattern used for
//! speculative VAD coordination elsewhere in this corpus (`CoordinatorState`
//! with a fixed `buffer_capacity`), adapted here to feed a pluggable STT
//! seam instead of a speech model directly.

use std::collections::VecDeque;

use crate::error::VadError;

/// Speech-to-text seam. Implementations may wrap an external model; the
/// crate ships [`NullSttModel`] so it builds and runs with no ML
/// dependency (stopword matching degrades to "never matches").
pub trait SttModel: Send {
    fn transcribe(&mut self, pcm: &[i16], sample_rate: u32) -> Result<String, VadError>;
}

pub struct NullSttModel;

impl SttModel for NullSttModel {
    fn transcribe(&mut self, _pcm: &[i16], _sample_rate: u32) -> Result<String, VadError> {
        Ok(String::new())
    }
}

/// A single configured stop phrase: one token, or two tokens that must both
/// appear within a 2-second span.
#[derive(Debug, Clone)]
enum StopPhrase {
    Single(String),
    Pair(String, String),
}

fn parse_stop_words(words: &[String]) -> Vec<StopPhrase> {
    words
        .iter()
        .map(|w| {
            let normalized = normalize(w);
            let mut parts = normalized.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(a), Some(b)) => StopPhrase::Pair(a.to_string(), b.to_string()),
                (Some(a), None) => StopPhrase::Single(a.to_string()),
                _ => StopPhrase::Single(String::new()),
            }
        })
        .collect()
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
}

pub struct StopwordDetector {
    stt: Box<dyn SttModel>,
    phrases: Vec<StopPhrase>,
    ring: VecDeque<i16>,
    ring_capacity: usize,
    sample_rate: u32,
}

impl StopwordDetector {
    pub fn new(stt: Box<dyn SttModel>, config: &crate::config::StopwordConfig, sample_rate: u32) -> Self {
        Self {
            stt,
            phrases: parse_stop_words(&config.stop_words),
            ring: VecDeque::new(),
            ring_capacity: (sample_rate as f64 * config.stopword_window_secs) as usize,
            sample_rate,
        }
    }

    /// Accumulate speech samples into the ring buffer (oldest samples drop
    /// once the window is full).
    pub fn push(&mut self, samples: &[i16]) {
        self.ring.extend(samples.iter().copied());
        while self.ring.len() > self.ring_capacity {
            self.ring.pop_front();
        }
    }

    /// Run STT over the current ring buffer and check for a match. Called
    /// when the VAD reports end-of-chunk.
    pub fn check_match(&mut self) -> Result<Option<String>, VadError> {
        if self.phrases.is_empty() {
            return Ok(None);
        }
        let pcm: Vec<i16> = self.ring.iter().copied().collect();
        let transcript = self.stt.transcribe(&pcm, self.sample_rate)?;
        let normalized = normalize(&transcript);
        let tokens: Vec<&str> = normalized.split_whitespace().collect();

        for phrase in &self.phrases {
            match phrase {
                StopPhrase::Single(word) => {
                    if tokens.contains(&word.as_str()) {
                        return Ok(Some(word.clone()));
                    }
                }
                StopPhrase::Pair(a, b) => {
                    if tokens.contains(&a.as_str()) && tokens.contains(&b.as_str()) {
                        return Ok(Some(format!("{a} {b}")));
                    }
                }
            }
        }
        Ok(None)
    }

    pub fn reset(&mut self) {
        self.ring.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StopwordConfig;

    struct FixedTranscriptStt(String);
    impl SttModel for FixedTranscriptStt {
        fn transcribe(&mut self, _pcm: &[i16], _sample_rate: u32) -> Result<String, VadError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn single_token_match() {
        let config = StopwordConfig {
            stop_words: vec!["computer".to_string()],
            stopword_window_secs: 2.0,
            ..StopwordConfig::default()
        };
        let mut detector = StopwordDetector::new(
            Box::new(FixedTranscriptStt("Hey Computer, what's up?".to_string())),
            &config,
            16_000,
        );
        detector.push(&[0i16; 100]);
        let matched = detector.check_match().unwrap();
        assert_eq!(matched, Some("computer".to_string()));
    }

    #[test]
    fn no_match_when_word_absent() {
        let config = StopwordConfig {
            stop_words: vec!["computer".to_string()],
            ..StopwordConfig::default()
        };
        let mut detector =
            StopwordDetector::new(Box::new(FixedTranscriptStt("hello there".to_string())), &config, 16_000);
        assert_eq!(detector.check_match().unwrap(), None);
    }

    #[test]
    fn pair_requires_both_tokens() {
        let config = StopwordConfig {
            stop_words: vec!["ok computer".to_string()],
            ..StopwordConfig::default()
        };
        let mut detector =
            StopwordDetector::new(Box::new(FixedTranscriptStt("ok let's go".to_string())), &config, 16_000);
        assert_eq!(detector.check_match().unwrap(), None);

        let mut detector = StopwordDetector::new(
            Box::new(FixedTranscriptStt("ok, computer!".to_string())),
            &config,
            16_000,
        );
        assert_eq!(detector.check_match().unwrap(), Some("ok computer".to_string()));
    }

    #[test]
    fn empty_stop_words_never_matches() {
        let config = StopwordConfig::default();
        let mut detector =
            StopwordDetector::new(Box::new(FixedTranscriptStt("computer".to_string())), &config, 16_000);
        assert_eq!(detector.check_match().unwrap(), None);
    }

    #[test]
    fn ring_buffer_drops_oldest_beyond_capacity() {
        let config = StopwordConfig {
            stopword_window_secs: 0.001,
            ..StopwordConfig::default()
        };
        let mut detector = StopwordDetector::new(Box::new(NullSttModel), &config, 16_000);
        detector.push(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert!(detector.ring.len() <= detector.ring_capacity.max(1));
    }
}
