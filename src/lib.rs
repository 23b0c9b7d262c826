//! Parley - voice chat client with gapless streaming playback
//!
//! This library provides the pieces of the Parley client:
//! - Streaming PCM playback with sample-accurate chunk scheduling
//! - Output backends (sound card, WAV render, headless)
//! - Chat endpoint client (text or recorded utterance in, speech out)
//! - Microphone capture with end-of-utterance detection
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      Inputs                          │
//! │   Microphone  │  Text prompt  │  PCM file / URL      │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Chat endpoint                       │
//! │   STT  │  LLM  │  TTS  →  raw f32le PCM stream       │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               StreamingPlayer                        │
//! │   PcmDecoder  │  PlaybackSession  │  AudioOutput     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod output;
pub mod player;
pub mod source;
pub mod voice;

pub use audio::{AudioChunk, PcmDecoder, SAMPLE_RATE};
pub use client::{ChatClient, ChatInput, ChatMessage, ChatReply, Role};
pub use config::Config;
pub use error::{Error, Result};
pub use output::{AudioOutput, DeviceOutput, MemoryOutput, OutputContext, WavOutput};
pub use player::{PlaybackOutcome, PlaybackSummary, PlayingState, StreamingPlayer};
