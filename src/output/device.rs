//! Playback to the sound card

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, StreamConfig, SupportedStreamConfigRange};
use rubato::{FftFixedIn, Resampler};

use super::{AudioOutput, EndedSignal, OutputContext, ScheduledSource, frame_at};
use crate::audio::AudioChunk;
use crate::{Error, Result};

/// Input frames per resampler pass (about 10ms at 24kHz)
const RESAMPLE_CHUNK: usize = 256;

/// Plays sessions on the default (or a named) output device
#[derive(Debug, Clone, Default)]
pub struct DeviceOutput {
    device_name: Option<String>,
}

impl DeviceOutput {
    /// Use the host's default output device
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the output device with this exact name
    #[must_use]
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }
}

impl AudioOutput for DeviceOutput {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputContext>> {
        let timeline = Arc::new(Timeline::default());
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let device_name = self.device_name.clone();
        let render_timeline = Arc::clone(&timeline);

        // cpal streams are not Send, so one thread owns the stream for the
        // whole session and drops it when the context closes
        let thread = std::thread::Builder::new()
            .name("parley-output".to_string())
            .spawn(move || {
                let (stream, device_rate) =
                    match start_stream(device_name.as_deref(), sample_rate, render_timeline) {
                        Ok(started) => started,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                let _ = ready_tx.send(Ok(device_rate));

                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("output stream released");
            })?;

        // Blocks the calling worker until the output thread reports back
        let device_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::Audio("output thread exited during setup".to_string()));
            }
        };

        let converter = if device_rate == sample_rate {
            None
        } else {
            tracing::info!(sample_rate, device_rate, "resampling to device rate");
            Some(RateConverter::new(sample_rate, device_rate)?)
        };

        Ok(Box::new(DeviceContext {
            sample_rate,
            device_rate,
            converter,
            timeline,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }))
    }
}

/// State shared between a device context and its render callback
#[derive(Default)]
struct Timeline {
    playlist: Mutex<Playlist>,
    /// Device frames rendered so far
    rendered: AtomicU64,
    /// Set once the device is gone
    failed: AtomicBool,
}

impl Timeline {
    fn lock(&self) -> MutexGuard<'_, Playlist> {
        self.playlist.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give up on the device; pending buffers resolve as not played
    fn fail(&self) {
        self.failed.store(true, Ordering::Release);
        self.lock().clear();
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// Audio waiting to be rendered, in device frames
#[derive(Default)]
struct Playlist {
    /// Buffers ordered by start frame
    buffers: VecDeque<Queued>,
    /// Ended notifications ordered by frame
    markers: VecDeque<Marker>,
}

struct Queued {
    start: u64,
    samples: Vec<f32>,
}

impl Queued {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

struct Marker {
    frame: u64,
    signal: EndedSignal,
}

impl Playlist {
    fn insert(&mut self, queued: Queued) {
        let index = self.buffers.partition_point(|q| q.start <= queued.start);
        self.buffers.insert(index, queued);
    }

    fn mark(&mut self, frame: u64, signal: EndedSignal) {
        let index = self.markers.partition_point(|m| m.frame <= frame);
        self.markers.insert(index, Marker { frame, signal });
    }

    /// Sample at device frame `frame`, retiring buffers that have played out
    #[allow(clippy::cast_possible_truncation)]
    fn sample_at(&mut self, frame: u64) -> f32 {
        while self.buffers.front().is_some_and(|q| q.end() <= frame) {
            self.buffers.pop_front();
        }

        self.buffers
            .front()
            .filter(|q| q.start <= frame)
            .map_or(0.0, |q| q.samples[(frame - q.start) as usize])
    }

    /// Fire every marker at or before `frame`
    fn notify_until(&mut self, frame: u64) {
        while self.markers.front().is_some_and(|m| m.frame <= frame) {
            if let Some(marker) = self.markers.pop_front() {
                marker.signal.notify();
            }
        }
    }

    fn clear(&mut self) {
        self.buffers.clear();
        self.markers.clear();
    }
}

/// Converts session-rate audio to the device rate across chunk boundaries
///
/// Consecutive chunks form one continuous segment through the resampler. A
/// chunk that does not start where the previous one ended (an underrun
/// resync) flushes the segment and starts a new one at its own frame.
struct RateConverter {
    resampler: FftFixedIn<f32>,
    session_rate: u32,
    device_rate: u32,
    /// Session samples not yet run through the resampler
    pending: Vec<f32>,
    /// Device frame the next converted sample lands on
    cursor: u64,
    /// Session time the current segment continues from
    expected: Option<f64>,
}

impl RateConverter {
    #[allow(clippy::cast_possible_truncation)]
    fn new(session_rate: u32, device_rate: u32) -> Result<Self> {
        let resampler = FftFixedIn::<f32>::new(
            session_rate as usize,
            device_rate as usize,
            RESAMPLE_CHUNK,
            1,
            1,
        )
        .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

        Ok(Self {
            resampler,
            session_rate,
            device_rate,
            pending: Vec::new(),
            cursor: 0,
            expected: None,
        })
    }

    /// Device frames the converted audio lags its session time by
    fn delay(&self) -> u64 {
        self.resampler.output_delay() as u64
    }

    /// Feed one chunk scheduled at `start_at`, returning converted buffers
    fn push(&mut self, samples: &[f32], start_at: f64) -> Result<Vec<Queued>> {
        let mut out = Vec::new();

        let tolerance = 0.5 / f64::from(self.session_rate);
        let contiguous = self
            .expected
            .is_some_and(|expected| (start_at - expected).abs() <= tolerance);
        if !contiguous {
            out.extend(self.flush()?);
            self.cursor = frame_at(start_at, self.device_rate);
        }

        #[allow(clippy::cast_precision_loss)]
        let duration = samples.len() as f64 / f64::from(self.session_rate);
        self.expected = Some(start_at + duration);
        self.pending.extend_from_slice(samples);

        while self.pending.len() >= self.resampler.input_frames_next() {
            let needed = self.resampler.input_frames_next();
            let converted = self
                .resampler
                .process(&[&self.pending[..needed]], None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            self.pending.drain(..needed);
            out.extend(self.place(converted));
        }

        Ok(out)
    }

    /// End the current segment, pushing out everything the resampler holds
    fn flush(&mut self) -> Result<Vec<Queued>> {
        if self.expected.take().is_none() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        if !self.pending.is_empty() {
            let converted = self
                .resampler
                .process_partial(Some(&[&self.pending[..]]), None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            self.pending.clear();
            out.extend(self.place(converted));
        }

        let tail = self
            .resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        out.extend(self.place(tail));

        self.resampler.reset();
        Ok(out)
    }

    /// Lay converted audio down at the cursor
    fn place(&mut self, converted: Vec<Vec<f32>>) -> Option<Queued> {
        let samples = converted.into_iter().next().unwrap_or_default();
        if samples.is_empty() {
            return None;
        }

        let start = self.cursor;
        self.cursor += samples.len() as u64;
        Some(Queued { start, samples })
    }
}

fn select_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    match name {
        Some(wanted) => host
            .output_devices()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n == wanted))
            .ok_or_else(|| Error::Audio(format!("output device not found: {wanted}"))),
        None => host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string())),
    }
}

fn select_config(device: &Device, sample_rate: u32) -> Result<StreamConfig> {
    let supports = |c: &SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels
            && c.sample_format() == SampleFormat::F32
            && c.min_sample_rate() <= SampleRate(sample_rate)
            && c.max_sample_rate() >= SampleRate(sample_rate)
    };

    let exact = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| supports(c, 1))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports(c, 2))
        });

    if let Some(range) = exact {
        return Ok(range.with_sample_rate(SampleRate(sample_rate)).config());
    }

    let default = device
        .default_output_config()
        .map_err(|e| Error::Audio(e.to_string()))?;

    if default.sample_format() != SampleFormat::F32 {
        return Err(Error::Audio(format!(
            "device has no f32 output config (default is {:?})",
            default.sample_format()
        )));
    }

    Ok(default.config())
}

/// Open the device and start rendering `timeline`; returns the device rate
fn start_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    timeline: Arc<Timeline>,
) -> Result<(cpal::Stream, u32)> {
    let device = select_device(device_name)?;
    let config = select_config(&device, sample_rate)?;
    let channels = usize::from(config.channels);
    let device_rate = config.sample_rate.0;

    let render_timeline = Arc::clone(&timeline);
    let mut position = 0_u64;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut playlist = render_timeline.lock();

                for frame in data.chunks_mut(channels) {
                    frame.fill(playlist.sample_at(position));
                    position += 1;
                }

                playlist.notify_until(position);
                render_timeline.rendered.store(position, Ordering::Release);
            },
            move |err| {
                tracing::error!(error = %err, "audio playback error");
                if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                    timeline.fail();
                }
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        device_rate,
        channels = config.channels,
        "audio playback initialized"
    );

    Ok((stream, device_rate))
}

struct DeviceContext {
    sample_rate: u32,
    device_rate: u32,
    converter: Option<RateConverter>,
    timeline: Arc<Timeline>,
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceContext {
    fn check_usable(&self) -> Result<()> {
        if self.shutdown.is_none() {
            return Err(Error::Audio("output context is closed".to_string()));
        }
        if self.timeline.has_failed() {
            return Err(Error::Audio("output device is no longer available".to_string()));
        }
        Ok(())
    }
}

impl OutputContext for DeviceContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[allow(clippy::cast_precision_loss)]
    fn current_time(&self) -> f64 {
        self.timeline.rendered.load(Ordering::Acquire) as f64 / f64::from(self.device_rate)
    }

    fn schedule(&mut self, chunk: AudioChunk, start_at: f64) -> Result<ScheduledSource> {
        self.check_usable()?;

        let duration = chunk.duration();
        let (source, signal) = ScheduledSource::new(start_at, duration);
        let end_frame = frame_at(start_at + duration, self.device_rate);

        let (buffers, end_frame) = match &mut self.converter {
            None => (
                vec![Queued {
                    start: frame_at(start_at, self.device_rate),
                    samples: chunk.into_samples(),
                }],
                end_frame,
            ),
            Some(converter) => (
                converter.push(chunk.samples(), start_at)?,
                end_frame + converter.delay(),
            ),
        };

        let mut playlist = self.timeline.lock();
        for queued in buffers {
            playlist.insert(queued);
        }
        playlist.mark(end_frame, signal);

        Ok(source)
    }

    fn drain(&mut self) -> Result<()> {
        self.check_usable()?;

        let Some(converter) = self.converter.as_mut() else {
            return Ok(());
        };

        let buffers = converter.flush()?;
        let mut playlist = self.timeline.lock();
        for queued in buffers {
            playlist.insert(queued);
        }
        Ok(())
    }

    fn close(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };

        self.timeline.lock().clear();
        let _ = shutdown.send(());

        // Blocks until the output thread has dropped the stream
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("output thread panicked");
            }
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Context whose "output thread" only waits for shutdown
    fn headless_context(sample_rate: u32, device_rate: u32) -> (DeviceContext, Arc<Timeline>) {
        let timeline = Arc::new(Timeline::default());
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            let _ = shutdown_rx.recv();
        });

        let converter =
            (device_rate != sample_rate).then(|| RateConverter::new(sample_rate, device_rate).unwrap());

        (
            DeviceContext {
                sample_rate,
                device_rate,
                converter,
                timeline: Arc::clone(&timeline),
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            },
            timeline,
        )
    }

    /// Run the render loop over `frames` device frames
    fn render(timeline: &Timeline, frames: u64) -> Vec<f32> {
        let mut playlist = timeline.lock();
        let start = timeline.rendered.load(Ordering::Acquire);
        let out: Vec<f32> = (start..start + frames).map(|f| playlist.sample_at(f)).collect();
        playlist.notify_until(start + frames);
        timeline.rendered.store(start + frames, Ordering::Release);
        out
    }

    #[allow(clippy::cast_precision_loss)]
    fn sine(len: usize, rate: u32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn renders_back_to_back_buffers() {
        let mut playlist = Playlist::default();
        playlist.insert(Queued {
            start: 2,
            samples: vec![0.3],
        });
        playlist.insert(Queued {
            start: 0,
            samples: vec![0.1, 0.2],
        });

        let rendered: Vec<f32> = (0..4).map(|f| playlist.sample_at(f)).collect();

        assert_eq!(rendered, vec![0.1, 0.2, 0.3, 0.0]);
        assert!(playlist.buffers.is_empty());
    }

    #[tokio::test]
    async fn markers_fire_once_rendered_past() {
        let (mut ctx, timeline) = headless_context(4, 4);
        let first = ctx.schedule(AudioChunk::new(vec![0.5; 2], 4), 0.0).unwrap();
        let second = ctx.schedule(AudioChunk::new(vec![0.25; 2], 4), 0.5).unwrap();

        assert_eq!(render(&timeline, 2), vec![0.5, 0.5]);
        assert!(first.ended().await);
        assert!((ctx.current_time() - 0.5).abs() < 1e-9);

        assert_eq!(render(&timeline, 3), vec![0.25, 0.25, 0.0]);
        assert!(second.ended().await);
    }

    #[tokio::test]
    async fn close_releases_pending_buffers() {
        let (mut ctx, timeline) = headless_context(4, 4);
        let source = ctx.schedule(AudioChunk::new(vec![0.5; 4], 4), 0.0).unwrap();

        ctx.close();

        assert!(!source.ended().await);
        assert!(ctx.thread.is_none());
        assert!(timeline.lock().buffers.is_empty());
        assert!(ctx.schedule(AudioChunk::new(vec![0.5; 4], 4), 1.0).is_err());
    }

    #[tokio::test]
    async fn device_loss_resolves_pending_as_not_played() {
        let (mut ctx, timeline) = headless_context(4, 4);
        let source = ctx.schedule(AudioChunk::new(vec![0.5; 4], 4), 0.0).unwrap();

        timeline.fail();

        assert!(!source.ended().await);
        assert!(ctx.schedule(AudioChunk::new(vec![0.5; 4], 4), 1.0).is_err());
        assert!(ctx.drain().is_err());
    }

    #[test]
    fn converter_output_is_contiguous_across_uneven_chunks() {
        let mut converter = RateConverter::new(24000, 48000).unwrap();
        let input = sine(2400, 24000);

        let mut buffers = Vec::new();
        let mut start_at = 0.0;
        for piece in input.chunks(97) {
            buffers.extend(converter.push(piece, start_at).unwrap());
            start_at += piece.len() as f64 / 24000.0;
        }
        buffers.extend(converter.flush().unwrap());

        for pair in buffers.windows(2) {
            assert_eq!(pair[1].start, pair[0].end());
        }
        let total: usize = buffers.iter().map(|b| b.samples.len()).sum();
        assert!(total >= 4800, "converted {total} frames");
    }

    #[test]
    fn converter_interpolates_instead_of_repeating() {
        let mut converter = RateConverter::new(24000, 44100).unwrap();
        let input = sine(4800, 24000);

        let mut buffers = converter.push(&input, 0.0).unwrap();
        buffers.extend(converter.flush().unwrap());
        let output: Vec<f32> = buffers.into_iter().flat_map(|b| b.samples).collect();

        // a sample-and-hold would repeat close to half of the frames
        let delay = usize::try_from(converter.delay()).unwrap_or(0);
        let steady = &output[delay + 512..delay + 4096];
        let repeats = steady.windows(2).filter(|w| w[0] == w[1]).count();
        assert!(repeats < steady.len() / 100, "{repeats} repeated frames");
    }

    #[test]
    fn resync_starts_a_new_segment() {
        let mut converter = RateConverter::new(24000, 48000).unwrap();

        let first = converter.push(&sine(1024, 24000), 0.0).unwrap();
        assert_eq!(first[0].start, 0);

        // a gap of one second in session time
        let second = converter.push(&sine(1024, 24000), 1.0).unwrap();
        let restart = second.iter().find(|b| b.start >= 48000).unwrap();
        assert_eq!(restart.start, 48000);
    }
}
