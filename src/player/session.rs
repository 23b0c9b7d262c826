//! State of one playback invocation

use crate::audio::{AudioChunk, PcmDecoder};
use crate::output::{OutputContext, ScheduledSource};
use crate::Result;

/// Bookkeeping for a single `play` call
///
/// The output context itself lives in the player's active slot so that
/// `stop` can release it from anywhere; the session only keeps the cursor,
/// the decoder and the handle of the last buffer it scheduled.
#[derive(Debug)]
pub struct PlaybackSession {
    generation: u64,
    next_start_time: f64,
    decoder: PcmDecoder,
    last_source: Option<ScheduledSource>,
    chunks: usize,
    samples: usize,
    resyncs: usize,
}

impl PlaybackSession {
    /// Start a session whose first chunk plays at `start_time`
    #[must_use]
    pub fn new(generation: u64, sample_rate: u32, start_time: f64) -> Self {
        Self {
            generation,
            next_start_time: start_time,
            decoder: PcmDecoder::new(sample_rate),
            last_source: None,
            chunks: 0,
            samples: 0,
            resyncs: 0,
        }
    }

    /// Generation this session belongs to
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// When the next chunk will start on the context clock
    #[must_use]
    pub const fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Decode a network read, keeping any partial sample for later
    pub fn decode(&mut self, bytes: &[u8]) -> AudioChunk {
        self.decoder.push(bytes)
    }

    /// Schedule `chunk` right after the previous one and advance the cursor
    ///
    /// If the context clock has already passed the cursor the producer fell
    /// behind; the cursor jumps forward to the clock instead of scheduling
    /// into the past.
    ///
    /// # Errors
    ///
    /// Returns error if the context rejects the buffer
    pub fn schedule(&mut self, context: &mut dyn OutputContext, chunk: AudioChunk) -> Result<()> {
        let now = context.current_time();
        if self.next_start_time < now {
            tracing::debug!(
                behind = now - self.next_start_time,
                generation = self.generation,
                "playback underrun, resyncing"
            );
            self.next_start_time = now;
            self.resyncs += 1;
        }

        let samples = chunk.len();
        let duration = chunk.duration();
        let source = context.schedule(chunk, self.next_start_time)?;

        tracing::trace!(
            generation = self.generation,
            start = self.next_start_time,
            samples,
            leftover = self.decoder.leftover_len(),
            "chunk scheduled"
        );

        self.next_start_time += duration;
        self.last_source = Some(source);
        self.chunks += 1;
        self.samples += samples;
        Ok(())
    }

    /// End of stream: drop the incomplete trailing sample
    ///
    /// Returns the summary and the handle of the final scheduled buffer, if
    /// anything was scheduled at all.
    pub fn finish(&mut self) -> (PlaybackSummary, Option<ScheduledSource>) {
        let discarded_bytes = self.decoder.finish();
        if discarded_bytes > 0 {
            tracing::trace!(
                generation = self.generation,
                discarded_bytes,
                "dropping incomplete trailing sample"
            );
        }

        let summary = PlaybackSummary {
            chunks: self.chunks,
            samples: self.samples,
            discarded_bytes,
            resyncs: self.resyncs,
        };
        (summary, self.last_source.take())
    }
}

/// What a finished session played
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackSummary {
    /// Buffers scheduled
    pub chunks: usize,
    /// Samples scheduled
    pub samples: usize,
    /// Trailing bytes that never completed a sample
    pub discarded_bytes: usize,
    /// Times the cursor had to jump forward to the clock
    pub resyncs: usize,
}

impl PlaybackSummary {
    /// Audio duration in seconds at `sample_rate`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self, sample_rate: u32) -> f64 {
        self.samples as f64 / f64::from(sample_rate)
    }
}
