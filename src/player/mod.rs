//! Gapless playback of streamed PCM
//!
//! [`StreamingPlayer::play`] decodes a byte stream as it arrives and
//! schedules every chunk to start exactly where the previous one ends on the
//! output clock, so irregular network delivery never produces gaps or
//! overlaps. Only one session is live at a time: starting a new one, or
//! calling [`StreamingPlayer::stop`], releases the previous session's output
//! and makes its pending reads irrelevant.

mod session;
mod state;

pub use session::{PlaybackSession, PlaybackSummary};
pub use state::PlayingState;

use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{Stream, StreamExt};
use tokio::sync::watch;

use crate::output::{AudioOutput, OutputContext};
use crate::{Error, Result};

/// How a `play` call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// The stream ended and all of its audio finished playing
    Finished(PlaybackSummary),
    /// The session was stopped or preempted by another `play`
    Cancelled,
}

/// The output context owned by the live session
struct ActiveSession {
    generation: u64,
    context: Box<dyn OutputContext>,
}

/// Streams raw `f32le` mono PCM to an [`AudioOutput`]
///
/// Clones share the same session slot and [`PlayingState`], so one clone can
/// be awaiting `play` while another calls `stop`.
#[derive(Clone)]
pub struct StreamingPlayer {
    output: Arc<dyn AudioOutput>,
    sample_rate: u32,
    state: PlayingState,
    active: Arc<Mutex<Option<ActiveSession>>>,
    generation: Arc<watch::Sender<u64>>,
}

impl std::fmt::Debug for StreamingPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingPlayer")
            .field("sample_rate", &self.sample_rate)
            .field("playing", &self.state.get())
            .field("generation", &*self.generation.borrow())
            .finish_non_exhaustive()
    }
}

impl StreamingPlayer {
    /// Create an idle player writing to `output` at `sample_rate`
    #[must_use]
    pub fn new(output: Arc<dyn AudioOutput>, sample_rate: u32) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            output,
            sample_rate,
            state: PlayingState::new(),
            active: Arc::new(Mutex::new(None)),
            generation: Arc::new(generation),
        }
    }

    /// Sample rate sessions are opened at
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Whether a session is currently playing
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.state.get()
    }

    /// Observable playing state
    #[must_use]
    pub const fn state(&self) -> &PlayingState {
        &self.state
    }

    /// Subscribe to playing state transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Play a stream of raw PCM bytes until it ends or the session is cancelled
    ///
    /// Any previous session is stopped first. `on_finished` runs only after
    /// the stream has ended *and* the last scheduled buffer has finished
    /// playing; it never runs for a cancelled session. Trailing bytes that do
    /// not complete a sample are dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the output cannot be opened, a buffer cannot be
    /// scheduled, the stream yields an error or the output is lost before
    /// the last buffer has played. The session is torn down in every case.
    pub async fn play<S, B, E, F>(&self, stream: S, on_finished: F) -> Result<PlaybackOutcome>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
        F: FnOnce(),
    {
        self.stop();

        let context = self.output.open(self.sample_rate)?;
        let start_time = context.current_time();
        let generation = self.begin(context);
        let mut session = PlaybackSession::new(generation, self.sample_rate, start_time);
        let mut superseded = self.generation.subscribe();

        tracing::debug!(generation, sample_rate = self.sample_rate, "playback session started");

        let mut stream = std::pin::pin!(stream);
        let mut first = true;

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                () = wait_superseded(&mut superseded, generation) => return Ok(self.cancelled(generation)),
            };

            if !self.is_current(generation) {
                return Ok(self.cancelled(generation));
            }

            if first {
                first = false;
                if !self.mark_playing(generation) {
                    return Ok(self.cancelled(generation));
                }
            }

            let bytes = match next {
                None => break,
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    tracing::warn!(generation, error = %e, "stream read failed, stopping playback");
                    self.stop_generation(generation);
                    return Err(Error::Stream(e.to_string()));
                }
            };

            let chunk = session.decode(bytes.as_ref());
            if chunk.is_empty() {
                continue;
            }

            let scheduled = self.with_context(generation, |context| session.schedule(context, chunk));
            match scheduled {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    self.stop_generation(generation);
                    return Err(e);
                }
                None => return Ok(self.cancelled(generation)),
            }
        }

        match self.with_context(generation, |context| context.drain()) {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                self.stop_generation(generation);
                return Err(e);
            }
            None => return Ok(self.cancelled(generation)),
        }

        let (summary, last) = session.finish();

        if let Some(last) = last {
            let played = tokio::select! {
                played = last.ended() => played,
                () = wait_superseded(&mut superseded, generation) => return Ok(self.cancelled(generation)),
            };

            if !played {
                if !self.stop_generation(generation) {
                    return Ok(self.cancelled(generation));
                }
                tracing::warn!(generation, "output lost before playback finished");
                return Err(Error::Audio(
                    "output stopped before playback finished".to_string(),
                ));
            }
        }

        if !self.stop_generation(generation) {
            return Ok(self.cancelled(generation));
        }

        tracing::debug!(
            generation,
            chunks = summary.chunks,
            samples = summary.samples,
            discarded_bytes = summary.discarded_bytes,
            "playback finished"
        );

        on_finished();
        Ok(PlaybackOutcome::Finished(summary))
    }

    /// Stop the live session, if any
    ///
    /// Releases the output (halting every scheduled buffer) and sets the
    /// playing state to `false`. Safe to call when idle.
    pub fn stop(&self) {
        self.release(None);
    }

    /// Tear down the live session, or only `generation` when given
    ///
    /// Bookkeeping happens under the session lock so a concurrent `play`
    /// never observes a half-stopped player; the context itself is closed
    /// after the lock is dropped.
    fn release(&self, generation: Option<u64>) -> bool {
        let released = {
            let mut active = self.lock_active();
            if let Some(generation) = generation {
                if !active.as_ref().is_some_and(|a| a.generation == generation) {
                    return false;
                }
            }

            let released = active.take();
            self.generation.send_modify(|g| *g += 1);
            self.state.set(false);
            released
        };

        if let Some(mut session) = released {
            session.context.close();
            tracing::debug!(generation = session.generation, "player stopped");
        }
        true
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `context` as the live session and return its generation
    fn begin(&self, context: Box<dyn OutputContext>) -> u64 {
        let (generation, previous) = {
            let mut active = self.lock_active();

            let mut generation = 0;
            self.generation.send_modify(|g| {
                *g += 1;
                generation = *g;
            });

            // a concurrent play may have installed its context after our stop
            let previous = active.replace(ActiveSession {
                generation,
                context,
            });
            (generation, previous)
        };

        if let Some(mut previous) = previous {
            previous.context.close();
        }
        generation
    }

    /// Flip the state to playing if `generation` is still live
    fn mark_playing(&self, generation: u64) -> bool {
        let active = self.lock_active();
        if active.as_ref().is_some_and(|a| a.generation == generation) {
            self.state.set(true);
            true
        } else {
            false
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        *self.generation.borrow() == generation
    }

    /// Run `f` on the context of `generation`, if it is still live
    fn with_context<T>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut dyn OutputContext) -> T,
    ) -> Option<T> {
        let mut active = self.lock_active();
        active
            .as_mut()
            .filter(|a| a.generation == generation)
            .map(|a| f(a.context.as_mut()))
    }

    /// Stop the session only if `generation` is still the live one
    fn stop_generation(&self, generation: u64) -> bool {
        self.release(Some(generation))
    }

    fn cancelled(&self, generation: u64) -> PlaybackOutcome {
        tracing::debug!(
            generation,
            current = *self.generation.borrow(),
            "playback session cancelled"
        );
        PlaybackOutcome::Cancelled
    }
}

/// Resolve once the player has moved past `generation`
async fn wait_superseded(rx: &mut watch::Receiver<u64>, generation: u64) {
    loop {
        if *rx.borrow_and_update() != generation {
            return;
        }
        if rx.changed().await.is_err() {
            // player dropped; nothing can supersede us any more
            std::future::pending::<()>().await;
        }
    }
}
