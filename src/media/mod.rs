//! Camera/microphone capture
//!
//! Device access and chunked encoding are backend traits; `MediaCaptureSession`
//! owns the acquired tracks and the chunk buffer on top of them.

pub mod backend;
pub mod capture;
pub mod synthetic;

pub use backend::{
    Blob, EncodedChunk, MediaConstraints, MediaDevices, MediaEncoder, MediaStream, MediaTrack,
    TrackKind,
};
pub use capture::{CaptureState, MediaCaptureSession};
pub use synthetic::{PermissionOutcome, SyntheticDevices, SyntheticEncoder};
