//! End-of-utterance detection
//!
//! Energy based: a block counts as speech when its RMS is above a fixed
//! threshold. An utterance is complete once enough speech has been followed
//! by enough silence.

/// RMS above which a block counts as speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum speech before an utterance can complete (in samples at 16kHz)
const MIN_SPEECH_SAMPLES: usize = 4800; // 0.3 seconds

/// Trailing silence that ends an utterance (in samples at 16kHz)
const SILENCE_SAMPLES: usize = 8000; // 0.5 seconds

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceState {
    /// Waiting for speech
    Idle,
    /// Speech heard, accumulating
    Speaking,
    /// Speech followed by silence; the utterance is ready
    Complete,
}

/// Splits a microphone feed into utterances
#[derive(Debug)]
pub struct UtteranceDetector {
    state: UtteranceState,
    buffer: Vec<f32>,
    silence: usize,
}

impl Default for UtteranceDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl UtteranceDetector {
    /// Create an idle detector with an empty buffer
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: UtteranceState::Idle,
            buffer: Vec::new(),
            silence: 0,
        }
    }

    /// Feed a block of samples, returning the resulting state
    ///
    /// Blocks fed after completion are ignored until the utterance is taken.
    pub fn process(&mut self, samples: &[f32]) -> UtteranceState {
        let energy = rms(samples);
        let is_speech = energy > ENERGY_THRESHOLD;

        match self.state {
            UtteranceState::Idle => {
                if is_speech {
                    self.state = UtteranceState::Speaking;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(samples);
                    self.silence = 0;
                    tracing::trace!(energy, "speech started");
                }
            }
            UtteranceState::Speaking => {
                self.buffer.extend_from_slice(samples);

                if is_speech {
                    self.silence = 0;
                } else {
                    self.silence += samples.len();
                }

                if self.silence > SILENCE_SAMPLES
                    && self.buffer.len() - self.silence > MIN_SPEECH_SAMPLES
                {
                    tracing::debug!(samples = self.buffer.len(), "utterance complete");
                    self.state = UtteranceState::Complete;
                } else if self.silence > SILENCE_SAMPLES * 2 {
                    tracing::trace!("too little speech, resetting");
                    self.reset();
                }
            }
            UtteranceState::Complete => {}
        }

        self.state
    }

    /// Current detector state
    #[must_use]
    pub const fn state(&self) -> UtteranceState {
        self.state
    }

    /// Samples accumulated for the current utterance
    #[must_use]
    pub fn buffer(&self) -> &[f32] {
        &self.buffer
    }

    /// Take the accumulated utterance and return to idle
    pub fn take_utterance(&mut self) -> Vec<f32> {
        self.state = UtteranceState::Idle;
        self.silence = 0;
        std::mem::take(&mut self.buffer)
    }

    /// Drop any accumulated speech and return to idle
    pub fn reset(&mut self) {
        self.state = UtteranceState::Idle;
        self.buffer.clear();
        self.silence = 0;
    }
}

/// Root mean square of a block
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    #[allow(clippy::cast_precision_loss)]
    let mean = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    mean.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 1600; // 0.1s

    fn loud() -> Vec<f32> {
        vec![0.2; BLOCK]
    }

    fn quiet() -> Vec<f32> {
        vec![0.0; BLOCK]
    }

    #[test]
    fn rms_of_constant_signal() {
        assert!((rms(&[0.5; 64]) - 0.5).abs() < 1e-6);
        assert!(rms(&[]).abs() < f32::EPSILON);
    }

    #[test]
    fn silence_stays_idle() {
        let mut detector = UtteranceDetector::new();
        for _ in 0..20 {
            assert_eq!(detector.process(&quiet()), UtteranceState::Idle);
        }
        assert!(detector.buffer().is_empty());
    }

    #[test]
    fn speech_then_silence_completes() {
        let mut detector = UtteranceDetector::new();
        for _ in 0..5 {
            assert_eq!(detector.process(&loud()), UtteranceState::Speaking);
        }
        let mut state = UtteranceState::Speaking;
        for _ in 0..6 {
            state = detector.process(&quiet());
        }
        assert_eq!(state, UtteranceState::Complete);

        // ignored once complete
        detector.process(&loud());
        let utterance = detector.take_utterance();
        assert_eq!(utterance.len(), 11 * BLOCK);
        assert_eq!(detector.state(), UtteranceState::Idle);
    }

    #[test]
    fn short_blip_resets() {
        let mut detector = UtteranceDetector::new();
        detector.process(&loud());
        for _ in 0..11 {
            detector.process(&quiet());
        }
        assert_eq!(detector.state(), UtteranceState::Idle);
        assert!(detector.buffer().is_empty());
    }
}
