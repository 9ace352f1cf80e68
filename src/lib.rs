pub mod api;
pub mod assessment;
pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod recording;
pub mod stream;

pub use api::{ApiClient, TokenStore};
pub use assessment::{
    reduce, Action, AssessmentSession, AssessmentState, AssessmentStore, Message, Phase, Speaker,
};
pub use config::Config;
pub use error::{Error, Result};
pub use media::{
    Blob, MediaCaptureSession, MediaConstraints, MediaDevices, MediaEncoder, MediaStream,
    SyntheticDevices, SyntheticEncoder,
};
pub use recording::{RecordingController, RecordingEvent, RecordingOptions, RecordingState, Visibility};
pub use stream::{consume_event_source, consume_stream, CancelToken, SseParser, StreamEvent, StreamOutcome};
