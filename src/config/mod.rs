//! Configuration management for Parley

pub mod file;

use std::sync::Arc;
use std::time::Duration;

use crate::audio::SAMPLE_RATE;
use crate::output::{AudioOutput, DeviceOutput};
use crate::{Error, Result};

use file::ParleyConfigFile;

/// Default chat endpoint (local dev server)
pub const DEFAULT_CHAT_ENDPOINT: &str = "http://localhost:5173/api/chat";

/// Exchanges of history the endpoint looks at
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Parley configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Chat endpoint configuration
    pub chat: ChatConfig,

    /// Playback configuration
    pub playback: PlaybackConfig,

    /// Microphone capture configuration
    pub capture: CaptureConfig,
}

/// Chat endpoint configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Endpoint URL
    pub endpoint: String,

    /// Request timeout
    pub timeout: Duration,

    /// Exchanges of history sent with each request
    pub history_limit: usize,
}

/// Playback configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Sample rate of the synthesized PCM stream
    pub sample_rate: u32,

    /// Output device name (default device when unset)
    pub output_device: Option<String>,
}

impl PlaybackConfig {
    /// Sound card output for this configuration
    #[must_use]
    pub fn device_output(&self) -> Arc<dyn AudioOutput> {
        match &self.output_device {
            Some(name) => Arc::new(DeviceOutput::with_device(name.clone())),
            None => Arc::new(DeviceOutput::new()),
        }
    }
}

/// Microphone capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Longest utterance recorded before sending
    pub max_duration: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chat: ChatConfig {
                endpoint: DEFAULT_CHAT_ENDPOINT.to_string(),
                timeout: Duration::from_secs(120),
                history_limit: DEFAULT_HISTORY_LIMIT,
            },
            playback: PlaybackConfig {
                sample_rate: SAMPLE_RATE,
                output_device: None,
            },
            capture: CaptureConfig {
                max_duration: Duration::from_secs(15),
            },
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with environment lookups
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn from_sources(
        fc: ParleyConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();

        let chat = ChatConfig {
            endpoint: env("PARLEY_CHAT_URL")
                .or(fc.chat.endpoint)
                .unwrap_or(defaults.chat.endpoint),
            timeout: parse_env(&env, "PARLEY_CHAT_TIMEOUT")?
                .or(fc.chat.timeout_secs)
                .map_or(defaults.chat.timeout, Duration::from_secs),
            history_limit: parse_env(&env, "PARLEY_HISTORY_LIMIT")?
                .or(fc.chat.history_limit)
                .unwrap_or(defaults.chat.history_limit),
        };

        let playback = PlaybackConfig {
            sample_rate: parse_env(&env, "PARLEY_SAMPLE_RATE")?
                .or(fc.playback.sample_rate)
                .unwrap_or(defaults.playback.sample_rate),
            output_device: env("PARLEY_OUTPUT_DEVICE")
                .or(fc.playback.output_device)
                .filter(|name| !name.is_empty()),
        };

        let capture = CaptureConfig {
            max_duration: parse_env(&env, "PARLEY_CAPTURE_SECONDS")?
                .or(fc.capture.max_seconds)
                .map_or(defaults.capture.max_duration, Duration::from_secs),
        };

        let config = Self {
            chat,
            playback,
            capture,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.playback.sample_rate == 0 {
            return Err(Error::Config("sample rate must be positive".to_string()));
        }
        if self.chat.history_limit == 0 {
            return Err(Error::Config("history limit must be positive".to_string()));
        }
        if self.chat.endpoint.is_empty() {
            return Err(Error::Config("chat endpoint is empty".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid value for {key}: {raw}")))
        })
        .transpose()
}
