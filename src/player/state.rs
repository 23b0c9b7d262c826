//! Observable "is playing" flag

use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Broadcasts whether a player is actively playing
///
/// Subscribers see the current value immediately and then every transition.
/// Setting the value it already holds notifies nobody, so observers never see
/// the same value twice in a row.
#[derive(Debug, Clone)]
pub struct PlayingState {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PlayingState {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayingState {
    /// Create an idle state
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the value, returning whether it changed
    pub fn set(&self, playing: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == playing {
                false
            } else {
                *current = playing;
                true
            }
        });

        if changed {
            tracing::debug!(playing, "playing state changed");
        }
        changed
    }

    /// Receiver positioned at the current value
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Stream yielding the current value, then every transition
    #[must_use]
    pub fn changes(&self) -> WatchStream<bool> {
        WatchStream::new(self.tx.subscribe())
    }
}
