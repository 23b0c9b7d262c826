use std::convert::Infallible;
use std::fmt::Display;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::{Stream, StreamExt};
use tracing_subscriber::EnvFilter;

use parley::output::AudioOutput;
use parley::source::{self, DEFAULT_READ_SIZE};
use parley::voice::{self, AudioCapture, CAPTURE_SAMPLE_RATE, UtteranceDetector, UtteranceState};
use parley::{
    ChatClient, ChatInput, ChatReply, Config, PlaybackOutcome, StreamingPlayer, WavOutput,
};

/// Parley - talk to a voice assistant with gapless streamed replies
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Render playback to a WAV file instead of the sound card
    #[arg(long, global = true)]
    wav: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Play a raw f32le PCM file or URL
    Play {
        /// File path or http(s) URL
        source: String,
    },
    /// Send a text prompt and play the reply
    Say {
        /// Prompt text
        text: String,
    },
    /// Record one spoken prompt and play the reply
    Talk {
        /// Maximum recording length in seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Interactive text conversation
    Chat,
    /// Test speaker output through the streaming player
    TestSpeaker,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,parley=info",
        1 => "info,parley=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    if let Command::TestMic { duration } = cli.command {
        return test_mic(duration).await;
    }

    let output: Arc<dyn AudioOutput> = match &cli.wav {
        Some(path) => Arc::new(WavOutput::new(path)),
        None => config.playback.device_output(),
    };
    let player = StreamingPlayer::new(output, config.playback.sample_rate);
    spawn_state_logger(&player);

    match cli.command {
        Command::Play { source } => play_source(&player, &source).await,
        Command::Say { text } => {
            let mut client = ChatClient::new(&config.chat)?;
            let reply = client.send(ChatInput::Text(text)).await?;
            play_reply(&player, reply).await
        }
        Command::Talk { seconds } => {
            let max = seconds.map_or(config.capture.max_duration, Duration::from_secs);
            let samples = record_utterance(max).await?;
            let wav = voice::samples_to_wav(&samples, CAPTURE_SAMPLE_RATE)?;
            let mut client = ChatClient::new(&config.chat)?;
            let reply = client.send(ChatInput::Audio(wav)).await?;
            play_reply(&player, reply).await
        }
        Command::Chat => chat_loop(&player, &config).await,
        Command::TestSpeaker => test_speaker(&player).await,
        Command::TestMic { .. } => Ok(()),
    }
}

/// Log every playing state transition
fn spawn_state_logger(player: &StreamingPlayer) {
    let mut changes = player.state().changes();
    tokio::spawn(async move {
        while let Some(playing) = changes.next().await {
            tracing::debug!(playing, "playing state");
        }
    });
}

/// Play `stream`, stopping the player on Ctrl-C
async fn play_interruptible<S, B, E>(player: &StreamingPlayer, stream: S) -> anyhow::Result<()>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let started = Instant::now();
    let play = player.play(stream, || tracing::debug!("last buffer played"));
    tokio::pin!(play);

    let outcome = tokio::select! {
        outcome = &mut play => outcome?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, stopping playback");
            player.stop();
            play.await?
        }
    };

    match outcome {
        PlaybackOutcome::Finished(summary) => {
            tracing::info!(
                chunks = summary.chunks,
                seconds = summary.duration(player.sample_rate()),
                resyncs = summary.resyncs,
                elapsed_ms = started.elapsed().as_millis(),
                "playback finished"
            );
            if summary.discarded_bytes > 0 {
                tracing::warn!(bytes = summary.discarded_bytes, "stream ended mid-sample");
            }
        }
        PlaybackOutcome::Cancelled => tracing::info!("playback cancelled"),
    }

    Ok(())
}

async fn play_source(player: &StreamingPlayer, source: &str) -> anyhow::Result<()> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let client = reqwest::Client::new();
        let stream = source::http_stream(&client, source).await?;
        play_interruptible(player, stream).await
    } else {
        let stream = source::file_stream(source, DEFAULT_READ_SIZE).await?;
        play_interruptible(player, stream).await
    }
}

async fn play_reply(player: &StreamingPlayer, reply: ChatReply) -> anyhow::Result<()> {
    println!("You: {}", reply.transcript);
    println!("Assistant: {}", reply.response);
    play_interruptible(player, reply.into_audio_stream()).await
}

/// Interactive loop; an empty line exits and `/clear` forgets the history
async fn chat_loop(player: &StreamingPlayer, config: &Config) -> anyhow::Result<()> {
    let mut client = ChatClient::new(&config.chat)?;
    println!("Type a message (empty line to quit, /clear to reset)\n");

    loop {
        let line = tokio::task::spawn_blocking(|| {
            dialoguer::Input::<String>::new()
                .with_prompt("You")
                .allow_empty(true)
                .interact_text()
        })
        .await??;

        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        if line == "/clear" {
            client.clear_history();
            println!("History cleared\n");
            continue;
        }

        match client.send(ChatInput::Text(line.to_string())).await {
            Ok(reply) => {
                println!("Assistant: {}", reply.response);
                play_interruptible(player, reply.into_audio_stream()).await?;
            }
            Err(e) => tracing::error!(error = %e, "chat request failed"),
        }
        println!();
    }
}

/// Record until the speaker pauses or `max` elapses
#[allow(clippy::future_not_send)]
async fn record_utterance(max: Duration) -> anyhow::Result<Vec<f32>> {
    let mut capture = AudioCapture::new()?;
    let mut detector = UtteranceDetector::new();
    capture.start()?;

    println!("Listening... (up to {}s)", max.as_secs());
    let deadline = Instant::now() + max;

    while Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let block = capture.take_buffer();
        if detector.process(&block) == UtteranceState::Complete {
            break;
        }
    }
    capture.stop();

    let samples = detector.take_utterance();
    if samples.is_empty() {
        anyhow::bail!("no speech detected");
    }

    tracing::debug!(samples = samples.len(), "utterance recorded");
    Ok(samples)
}

/// Stream a 440Hz tone through the player in irregular chunk sizes
async fn test_speaker(player: &StreamingPlayer) -> anyhow::Result<()> {
    const SPLITS: [usize; 6] = [1, 4093, 7, 513, 2048, 10];

    println!("Testing speaker output...");
    println!("You should hear a steady 440Hz tone for 2 seconds\n");

    let sample_rate = player.sample_rate();
    #[allow(clippy::cast_precision_loss)]
    let bytes: Vec<u8> = (0..sample_rate * 2)
        .flat_map(|i| {
            let t = i as f32 / sample_rate as f32;
            ((2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.3).to_le_bytes()
        })
        .collect();

    let mut chunks = Vec::new();
    let mut rest = Bytes::from(bytes);
    for size in SPLITS.iter().cycle() {
        if rest.is_empty() {
            break;
        }
        chunks.push(Ok::<_, Infallible>(rest.split_to((*size).min(rest.len()))));
    }

    println!("Streaming {} chunks at {sample_rate} Hz...", chunks.len());
    play_interruptible(player, futures::stream::iter(chunks)).await?;

    println!("\n---");
    println!("If the tone was continuous, gapless playback is working!");
    println!("Clicks or dropouts mean chunks were not scheduled back to back.");

    Ok(())
}

/// Print input levels once a second
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new()?;
    capture.start()?;

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.take_buffer();
        let energy = voice::rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");

    Ok(())
}
