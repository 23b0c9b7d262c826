//! Headless output with a caller-driven clock

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{AudioOutput, EndedSignal, OutputContext, ScheduledSource};
use crate::audio::AudioChunk;
use crate::{Error, Result};

/// Slack when comparing buffer ends against the clock
const CLOCK_TOLERANCE: f64 = 1e-9;

/// One buffer as it was handed to a [`MemoryOutput`] context
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRecord {
    /// Index of the context it was scheduled on (0 = first opened)
    pub context: usize,
    /// Scheduled start on the clock
    pub start_time: f64,
    /// Decoded samples
    pub samples: Vec<f32>,
    /// Rate the context runs at
    pub sample_rate: u32,
}

impl ScheduledRecord {
    /// Playback duration in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    /// Scheduled end on the clock
    #[must_use]
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    clock: f64,
    opened: usize,
    closed: usize,
    disconnected: bool,
    records: Vec<ScheduledRecord>,
    pending: Vec<Pending>,
}

#[derive(Debug)]
struct Pending {
    context: usize,
    end_time: f64,
    signal: EndedSignal,
}

/// Records scheduled audio instead of playing it
///
/// Time only moves when [`MemoryOutput::advance`] is called; buffers are
/// reported ended once the clock reaches their end. Clones share state, so a
/// test can hand one clone to the player and inspect another.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryOutput {
    /// Create an output with the clock at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the clock forward, ending every buffer that has finished
    pub fn advance(&self, seconds: f64) {
        let finished = {
            let mut state = self.lock();
            state.clock += seconds;
            let clock = state.clock;
            let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|p| p.end_time <= clock + CLOCK_TOLERANCE);
            state.pending = waiting;
            done
        };

        for pending in finished {
            pending.signal.notify();
        }
    }

    /// Current clock in seconds
    #[must_use]
    pub fn clock(&self) -> f64 {
        self.lock().clock
    }

    /// Every buffer scheduled so far, in scheduling order
    #[must_use]
    pub fn records(&self) -> Vec<ScheduledRecord> {
        self.lock().records.clone()
    }

    /// All scheduled samples concatenated in scheduling order
    #[must_use]
    pub fn samples(&self) -> Vec<f32> {
        self.lock()
            .records
            .iter()
            .flat_map(|r| r.samples.iter().copied())
            .collect()
    }

    /// Number of contexts opened
    #[must_use]
    pub fn opened(&self) -> usize {
        self.lock().opened
    }

    /// Number of contexts closed
    #[must_use]
    pub fn closed(&self) -> usize {
        self.lock().closed
    }

    /// Number of contexts currently open
    #[must_use]
    pub fn open_contexts(&self) -> usize {
        let state = self.lock();
        state.opened - state.closed
    }

    /// Simulate losing the device
    ///
    /// Every pending buffer resolves as not played and open contexts reject
    /// further buffers. Contexts stay open until closed by their owner.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.disconnected = true;
        state.pending.clear();
        tracing::trace!("memory output disconnected");
    }

    /// Buffers scheduled but not yet ended
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }
}

impl AudioOutput for MemoryOutput {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputContext>> {
        let id = {
            let mut state = self.lock();
            if state.disconnected {
                return Err(Error::Audio("output device disconnected".to_string()));
            }
            state.opened += 1;
            state.opened - 1
        };

        tracing::trace!(context = id, sample_rate, "memory output opened");

        Ok(Box::new(MemoryContext {
            id,
            sample_rate,
            output: self.clone(),
            closed: false,
        }))
    }
}

struct MemoryContext {
    id: usize,
    sample_rate: u32,
    output: MemoryOutput,
    closed: bool,
}

impl OutputContext for MemoryContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.output.clock()
    }

    fn schedule(&mut self, chunk: AudioChunk, start_at: f64) -> Result<ScheduledSource> {
        if self.closed {
            return Err(Error::Audio("output context is closed".to_string()));
        }

        let duration = chunk.duration();
        let (source, signal) = ScheduledSource::new(start_at, duration);

        let mut state = self.output.lock();
        if state.disconnected {
            return Err(Error::Audio("output device disconnected".to_string()));
        }
        state.records.push(ScheduledRecord {
            context: self.id,
            start_time: start_at,
            samples: chunk.into_samples(),
            sample_rate: self.sample_rate,
        });
        state.pending.push(Pending {
            context: self.id,
            end_time: start_at + duration,
            signal,
        });

        Ok(source)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut state = self.output.lock();
        state.closed += 1;
        // dropping the signals resolves their sources as not played
        state.pending.retain(|p| p.context != self.id);
        tracing::trace!(context = self.id, "memory output closed");
    }
}

impl Drop for MemoryContext {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnect_drops_pending_buffers() {
        let output = MemoryOutput::new();
        let mut ctx = output.open(4).unwrap();
        let source = ctx.schedule(AudioChunk::new(vec![0.0; 2], 4), 0.0).unwrap();

        output.disconnect();

        assert!(!source.ended().await);
        assert_eq!(output.pending(), 0);
        assert_eq!(output.open_contexts(), 1);
        assert!(ctx.schedule(AudioChunk::new(vec![0.0; 2], 4), 0.5).is_err());
        assert!(output.open(4).is_err());
    }

    #[tokio::test]
    async fn advance_ends_finished_buffers() {
        let output = MemoryOutput::new();
        let mut ctx = output.open(4).unwrap();

        let first = ctx.schedule(AudioChunk::new(vec![0.0; 2], 4), 0.0).unwrap();
        let second = ctx.schedule(AudioChunk::new(vec![0.0; 2], 4), 0.5).unwrap();
        assert_eq!(output.pending(), 2);

        output.advance(0.5);
        assert!(first.ended().await);
        assert_eq!(output.pending(), 1);

        output.advance(0.5);
        assert!(second.ended().await);
        assert_eq!(output.pending(), 0);
    }

    #[tokio::test]
    async fn close_drops_pending_buffers() {
        let output = MemoryOutput::new();
        let mut ctx = output.open(4).unwrap();
        let source = ctx.schedule(AudioChunk::new(vec![0.0; 4], 4), 0.0).unwrap();

        ctx.close();
        ctx.close();

        assert!(!source.ended().await);
        assert_eq!(output.opened(), 1);
        assert_eq!(output.closed(), 1);
        assert!(ctx.schedule(AudioChunk::new(vec![0.0], 4), 1.0).is_err());
    }

    #[test]
    fn drop_closes_context() {
        let output = MemoryOutput::new();
        let ctx = output.open(24000).unwrap();
        assert_eq!(output.open_contexts(), 1);

        drop(ctx);
        assert_eq!(output.open_contexts(), 0);
    }
}
