use std::time::Duration;

use crate::media::MediaConstraints;

/// Options for a recording controller
#[derive(Debug, Clone)]
pub struct RecordingOptions {
    /// Devices to request on initialize
    pub constraints: MediaConstraints,

    /// Start recording straight from initialize instead of stopping at `Ready`
    pub auto_start: bool,

    /// Active recording time after which `MaxDurationReached` fires
    /// Zero disables the limit
    pub max_duration: Duration,

    /// Period of progressive chunk hand-off
    /// Default: 10 seconds, zero disables
    pub chunk_upload_interval: Duration,

    /// Delay before auto-resuming once the page is visible again
    pub visibility_resume_delay: Duration,
}

impl RecordingOptions {
    pub fn chunk_upload_enabled(&self) -> bool {
        !self.chunk_upload_interval.is_zero()
    }
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self {
            constraints: MediaConstraints::default(),
            auto_start: false,
            max_duration: Duration::ZERO,
            chunk_upload_interval: Duration::from_secs(10),
            visibility_resume_delay: Duration::from_millis(500),
        }
    }
}
