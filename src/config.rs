use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::media::MediaConstraints;
use crate::recording::RecordingOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_path")]
    pub token_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    #[serde(default)]
    pub auto_start: bool,
    /// 0 = unlimited
    #[serde(default)]
    pub max_duration_secs: u64,
    /// 0 disables progressive upload
    #[serde(default = "default_chunk_upload_interval")]
    pub chunk_upload_interval_ms: u64,
    #[serde(default = "default_visibility_resume_delay")]
    pub visibility_resume_delay_ms: u64,
    #[serde(default = "enabled")]
    pub video: bool,
    #[serde(default = "enabled")]
    pub audio: bool,
    /// Encoder chunk length
    #[serde(default = "default_timeslice")]
    pub timeslice_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Config {
    /// Read `path` (any format the `config` crate knows) with
    /// `ASSESSMENT__SECTION__KEY` environment overrides on top
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("ASSESSMENT").separator("__"))
            .build()
            .with_context(|| format!("failed to read config from {}", path))?;

        settings
            .try_deserialize()
            .context("invalid configuration")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.api.connect_timeout_secs)
    }
}

impl RecordingConfig {
    pub fn timeslice(&self) -> Duration {
        Duration::from_millis(self.timeslice_ms)
    }

    pub fn to_options(&self) -> RecordingOptions {
        RecordingOptions {
            constraints: MediaConstraints {
                video: self.video,
                audio: self.audio,
            },
            auto_start: self.auto_start,
            max_duration: Duration::from_secs(self.max_duration_secs),
            chunk_upload_interval: Duration::from_millis(self.chunk_upload_interval_ms),
            visibility_resume_delay: Duration::from_millis(self.visibility_resume_delay_ms),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_path: default_token_path(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            auto_start: false,
            max_duration_secs: 0,
            chunk_upload_interval_ms: default_chunk_upload_interval(),
            visibility_resume_delay_ms: default_visibility_resume_delay(),
            video: true,
            audio: true,
            timeslice_ms: default_timeslice(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_token_path() -> String {
    "~/.config/assessment-session/token".to_string()
}

fn default_chunk_upload_interval() -> u64 {
    10_000
}

fn default_visibility_resume_delay() -> u64 {
    500
}

fn default_timeslice() -> u64 {
    1_000
}

fn default_level() -> String {
    "info".to_string()
}

fn enabled() -> bool {
    true
}
