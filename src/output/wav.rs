//! Offline rendering into a WAV file

use std::path::{Path, PathBuf};

use super::{AudioOutput, OutputContext, ScheduledSource, frame_at};
use crate::audio::AudioChunk;
use crate::{Error, Result};

/// Renders each playback session into a mono 32-bit float WAV file
///
/// Nothing is played in real time: the context clock stays at zero and every
/// buffer is reported ended as soon as it is placed on the timeline. The file
/// is written when the session's context is closed.
#[derive(Debug, Clone)]
pub struct WavOutput {
    path: PathBuf,
}

impl WavOutput {
    /// Render to `path`, overwriting it on every session
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Destination file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AudioOutput for WavOutput {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputContext>> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                return Err(Error::Audio(format!(
                    "output directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        tracing::debug!(path = %self.path.display(), sample_rate, "rendering to wav");

        Ok(Box::new(WavContext {
            path: self.path.clone(),
            sample_rate,
            timeline: Vec::new(),
            closed: false,
        }))
    }
}

struct WavContext {
    path: PathBuf,
    sample_rate: u32,
    timeline: Vec<f32>,
    closed: bool,
}

impl WavContext {
    fn write(&self) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };

        let mut writer =
            hound::WavWriter::create(&self.path, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in &self.timeline {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))
    }
}

impl OutputContext for WavContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        0.0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn schedule(&mut self, chunk: AudioChunk, start_at: f64) -> Result<ScheduledSource> {
        if self.closed {
            return Err(Error::Audio("wav output is closed".to_string()));
        }

        let start = frame_at(start_at, self.sample_rate) as usize;
        let end = start + chunk.len();
        if self.timeline.len() < end {
            self.timeline.resize(end, 0.0);
        }
        self.timeline[start..end].copy_from_slice(chunk.samples());

        let (source, signal) = ScheduledSource::new(start_at, chunk.duration());
        signal.notify();
        Ok(source)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        match self.write() {
            Ok(()) => tracing::info!(
                path = %self.path.display(),
                samples = self.timeline.len(),
                "wav render complete"
            ),
            Err(e) => tracing::error!(path = %self.path.display(), error = %e, "wav render failed"),
        }
    }
}

impl Drop for WavContext {
    fn drop(&mut self) {
        self.close();
    }
}
