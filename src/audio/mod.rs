//! Raw PCM audio primitives
//!
//! The chat endpoint streams headerless mono little-endian `f32` samples.
//! [`PcmDecoder`] turns arbitrary network reads into [`AudioChunk`]s.

mod decoder;

pub use decoder::{BYTES_PER_SAMPLE, PcmDecoder};

/// Sample rate agreed with the speech synthesizer
pub const SAMPLE_RATE: u32 = 24000;

/// Mono `f32` samples decoded from a single read
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioChunk {
    /// Wrap decoded samples
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decoded samples
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Consume the chunk, returning its samples
    #[must_use]
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the read produced no complete sample
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample rate the samples were encoded at
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Playback duration in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}
