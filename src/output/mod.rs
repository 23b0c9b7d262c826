//! Audio output backends
//!
//! The player never touches a sound card directly. It opens an
//! [`OutputContext`] from an [`AudioOutput`] for every playback session and
//! schedules decoded chunks on the context's clock.
//!
//! Backends:
//! - [`DeviceOutput`] - default (or named) sound card via cpal
//! - [`WavOutput`] - offline render into a WAV file
//! - [`MemoryOutput`] - headless recorder with a caller-driven clock

mod device;
mod memory;
mod wav;

pub use device::DeviceOutput;
pub use memory::{MemoryOutput, ScheduledRecord};
pub use wav::WavOutput;

use tokio::sync::oneshot;

use crate::Result;
use crate::audio::AudioChunk;

/// Factory for playback contexts
pub trait AudioOutput: Send + Sync {
    /// Open a fresh playback context running at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the underlying output cannot be opened
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputContext>>;
}

/// A live playback context with its own clock
///
/// Dropping a context closes it.
pub trait OutputContext: Send {
    /// Rate every scheduled chunk is played at
    fn sample_rate(&self) -> u32;

    /// Current position of the context clock in seconds
    fn current_time(&self) -> f64;

    /// Schedule `chunk` to start playing at `start_at` on the context clock
    ///
    /// # Errors
    ///
    /// Returns error if the context is closed or rejects the buffer
    fn schedule(&mut self, chunk: AudioChunk, start_at: f64) -> Result<ScheduledSource>;

    /// Push out audio the context is still holding back
    ///
    /// Called once after the last chunk of a stream has been scheduled.
    ///
    /// # Errors
    ///
    /// Returns error if the held audio cannot be scheduled
    fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release the output, halting every scheduled buffer
    ///
    /// Idempotent. Pending [`ScheduledSource::ended`] notifications resolve
    /// as not played. Backends that lose their device resolve them the same
    /// way without being closed.
    fn close(&mut self);
}

/// Handle to one buffer scheduled on an [`OutputContext`]
#[derive(Debug)]
pub struct ScheduledSource {
    start_time: f64,
    duration: f64,
    ended: oneshot::Receiver<()>,
}

/// Sender half of a [`ScheduledSource`] kept by the backend
#[derive(Debug)]
pub struct EndedSignal(oneshot::Sender<()>);

impl EndedSignal {
    /// Report that the buffer has finished playing
    pub fn notify(self) {
        let _ = self.0.send(());
    }
}

impl ScheduledSource {
    /// Create a source handle plus the signal the backend fires when it ends
    #[must_use]
    pub fn new(start_time: f64, duration: f64) -> (Self, EndedSignal) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                start_time,
                duration,
                ended: rx,
            },
            EndedSignal(tx),
        )
    }

    /// Scheduled start on the context clock
    #[must_use]
    pub const fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Scheduled end on the context clock
    #[must_use]
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    /// Wait until the buffer has finished playing
    ///
    /// Returns `false` if the context was closed before the buffer ended.
    pub async fn ended(self) -> bool {
        self.ended.await.is_ok()
    }
}

/// Convert a clock time to a frame index, clamping negatives to zero
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn frame_at(seconds: f64, sample_rate: u32) -> u64 {
    (seconds * f64::from(sample_rate)).round().max(0.0) as u64
}
