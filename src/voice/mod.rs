//! Voice input
//!
//! Microphone capture and end-of-utterance detection for spoken prompts.

mod capture;
mod utterance;

pub use capture::{AudioCapture, CAPTURE_SAMPLE_RATE, samples_to_wav};
pub use utterance::{UtteranceDetector, UtteranceState, rms};
