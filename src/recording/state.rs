use std::time::Duration;

use crate::error::Error;
use crate::media::Blob;

/// Lifecycle of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Initializing,
    Ready,
    Recording,
    Paused,
    Stopping,
    Completed,
    Error,
    Abandoned,
}

impl RecordingState {
    /// States in which the encoder holds live tracks
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RecordingState::Ready | RecordingState::Recording | RecordingState::Paused
        )
    }
}

/// Page visibility reported by the host environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Notifications emitted by the controller
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingEvent {
    StateChanged(RecordingState),
    /// Chunks produced since the previous hand-off
    ChunkReady { blob: Blob, sequence: u64 },
    /// Fired once per session; recording continues
    MaxDurationReached,
    Failed(Error),
}

/// Point-in-time view of a controller
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSnapshot {
    pub state: RecordingState,
    /// Active recording time, paused time excluded
    pub duration: Duration,
    pub chunk_count: usize,
    pub last_flushed_index: usize,
    pub next_sequence: u64,
    pub paused_by_visibility: bool,
    pub error: Option<Error>,
}
