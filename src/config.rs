//! Command-line parsing and validation helpers.

use anyhow::{bail, Result};
use clap::{ArgAction, Parser};
use std::time::Duration;

const DEFAULT_SAMPLE_RATE: u32 = 24_000;
const DEFAULT_FRAME_MS: u64 = 40;
const DEFAULT_CHUNK_MS: u64 = 250;
const DEFAULT_VAD_THRESHOLD: f32 = 0.01;
const DEFAULT_SILENCE_WINDOW_MS: u64 = 800;
const DEFAULT_MAX_RECORDING_MS: u64 = 30_000;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;
const MAX_RECORDING_HARD_LIMIT_MS: u64 = 30_000;

/// CLI options for the voicewire client. Validated values keep the capture
/// and streaming loops inside safe bounds.
#[derive(Debug, Parser, Clone)]
#[command(about = "Live voice conversation client for remote agents", author, version)]
pub struct AppConfig {
    /// Base URL of the bootstrap API (agent lookup, swarm create/join)
    #[arg(long, default_value = "https://api.kairoswarm.dev")]
    pub api_url: String,

    /// Agent name to converse with
    #[arg(long, default_value = "concierge")]
    pub agent: String,

    /// Display name used when joining the session
    #[arg(long = "join-name", default_value = "Guest")]
    pub join_name: String,

    /// Preferred audio input device name
    #[arg(long)]
    pub input_device: Option<String>,

    /// Print detected audio input devices and exit
    #[arg(long = "list-input-devices", default_value_t = false)]
    pub list_input_devices: bool,

    /// Stop recording automatically when the VAD detects trailing silence
    #[arg(long = "hands-free", default_value_t = false)]
    pub hands_free: bool,

    /// Skip the one-shot request for the agent's opening line
    #[arg(long = "no-auto-intro", action = ArgAction::SetFalse, default_value_t = true)]
    pub auto_intro: bool,

    /// Capture sample rate (Hz)
    #[arg(long = "sample-rate", default_value_t = DEFAULT_SAMPLE_RATE)]
    pub sample_rate: u32,

    /// VAD analysis frame size (milliseconds)
    #[arg(long = "frame-ms", default_value_t = DEFAULT_FRAME_MS)]
    pub frame_ms: u64,

    /// Outbound chunk duration (milliseconds of audio per wire frame)
    #[arg(long = "chunk-ms", default_value_t = DEFAULT_CHUNK_MS)]
    pub chunk_ms: u64,

    /// RMS level above which a frame counts as speech (linear, 0..1)
    #[arg(long = "vad-threshold", default_value_t = DEFAULT_VAD_THRESHOLD)]
    pub vad_threshold: f32,

    /// Trailing silence required before a hands-free stop (milliseconds)
    #[arg(long = "silence-window-ms", default_value_t = DEFAULT_SILENCE_WINDOW_MS)]
    pub silence_window_ms: u64,

    /// Hard cap on a single recording before forced stop (milliseconds)
    #[arg(long = "max-recording-ms", default_value_t = DEFAULT_MAX_RECORDING_MS)]
    pub max_recording_ms: u64,

    /// Frame channel capacity between the device callback and capture loop
    #[arg(long = "channel-capacity", default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    pub channel_capacity: usize,
}

/// Snapshot of the capture/VAD knobs handed to the pipeline components.
#[derive(Debug, Clone)]
pub struct VoiceLoopConfig {
    pub sample_rate: u32,
    pub frame_ms: u64,
    pub chunk_ms: u64,
    pub vad_threshold: f32,
    pub silence_window: Duration,
    pub max_recording: Duration,
    pub channel_capacity: usize,
    pub hands_free: bool,
}

impl AppConfig {
    /// Parse CLI arguments and validate them right away.
    pub fn parse_args() -> Result<Self> {
        let mut config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Check CLI values and normalize them.
    pub(crate) fn validate(&mut self) -> Result<()> {
        let trimmed = self.api_url.trim_end_matches('/').to_string();
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            bail!(
                "--api-url must start with http:// or https://, got '{}'",
                self.api_url
            );
        }
        self.api_url = trimmed;

        if self.agent.trim().is_empty() {
            bail!("--agent cannot be empty");
        }
        if self.join_name.trim().is_empty() {
            bail!("--join-name cannot be empty");
        }

        if !(8_000..=96_000).contains(&self.sample_rate) {
            bail!(
                "--sample-rate must be between 8000 and 96000 Hz, got {}",
                self.sample_rate
            );
        }
        if !(5..=120).contains(&self.frame_ms) {
            bail!("--frame-ms must be between 5 and 120, got {}", self.frame_ms);
        }
        if !(50..=2_000).contains(&self.chunk_ms) {
            bail!("--chunk-ms must be between 50 and 2000, got {}", self.chunk_ms);
        }
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            bail!(
                "--vad-threshold must be between 0.0 and 1.0, got {}",
                self.vad_threshold
            );
        }
        if self.max_recording_ms == 0 || self.max_recording_ms > MAX_RECORDING_HARD_LIMIT_MS {
            bail!(
                "--max-recording-ms must be between 1 and {MAX_RECORDING_HARD_LIMIT_MS} ms, got {}",
                self.max_recording_ms
            );
        }
        if self.silence_window_ms < 200 || self.silence_window_ms > self.max_recording_ms {
            bail!(
                "--silence-window-ms must be >=200 and <= --max-recording-ms ({})",
                self.max_recording_ms
            );
        }
        if !(8..=1024).contains(&self.channel_capacity) {
            bail!(
                "--channel-capacity must be between 8 and 1024, got {}",
                self.channel_capacity
            );
        }

        Ok(())
    }

    /// Snapshot the current CLI-controlled voice settings for the pipeline.
    pub fn voice_loop_config(&self) -> VoiceLoopConfig {
        VoiceLoopConfig {
            sample_rate: self.sample_rate,
            frame_ms: self.frame_ms,
            chunk_ms: self.chunk_ms,
            vad_threshold: self.vad_threshold,
            silence_window: Duration::from_millis(self.silence_window_ms),
            max_recording: Duration::from_millis(self.max_recording_ms),
            channel_capacity: self.channel_capacity,
            hands_free: self.hands_free,
        }
    }
}

impl Default for VoiceLoopConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_ms: DEFAULT_FRAME_MS,
            chunk_ms: DEFAULT_CHUNK_MS,
            vad_threshold: DEFAULT_VAD_THRESHOLD,
            silence_window: Duration::from_millis(DEFAULT_SILENCE_WINDOW_MS),
            max_recording: Duration::from_millis(DEFAULT_MAX_RECORDING_MS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            hands_free: false,
        }
    }
}
