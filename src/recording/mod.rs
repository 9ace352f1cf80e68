//! Recording session management
//!
//! `RecordingController` drives a `MediaCaptureSession` through the recording
//! lifecycle:
//! - Device acquisition and encoder start (optionally paused until started)
//! - Manual and visibility-driven pause/resume
//! - Max-duration notification
//! - Periodic chunk hand-off for progressive upload
//! - Finalization, abandonment and reset

mod config;
mod controller;
mod state;

pub use config::RecordingOptions;
pub use controller::RecordingController;
pub use state::{RecordingEvent, RecordingSnapshot, RecordingState, Visibility};
