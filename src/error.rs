use thiserror::Error;

/// Failures surfaced by the capture, streaming and session layers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("recorder fault: {0}")]
    RecorderFault(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP error: status {status}")]
    Http { status: u16 },

    #[error("unauthorized")]
    Unauthorized,

    #[error("stream ended before a terminal event")]
    StreamIncomplete,

    #[error("malformed `{event}` payload: {reason}")]
    MalformedEventPayload { event: String, reason: String },

    #[error("server error: {message}")]
    Server { message: String, recoverable: bool },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether retrying the same operation can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::PermissionDenied(_)
            | Error::DeviceUnavailable(_)
            | Error::Network(_)
            | Error::StreamIncomplete
            | Error::MalformedEventPayload { .. } => true,
            Error::Http { status } => *status >= 500,
            Error::Server { recoverable, .. } => *recoverable,
            Error::RecorderFault(_)
            | Error::Unauthorized
            | Error::InvalidState(_)
            | Error::Config(_)
            | Error::Io(_) => false,
        }
    }

    /// A 401 ends the whole session instead of retrying locally
    pub fn requires_logout(&self) -> bool {
        matches!(self, Error::Unauthorized | Error::Http { status: 401 })
    }

    /// Message shown to the learner
    pub fn user_message(&self) -> String {
        match self {
            Error::PermissionDenied(_) => {
                "Camera and microphone access was denied. Allow access and try again.".to_string()
            }
            Error::DeviceUnavailable(_) => {
                "No camera or microphone was found. Connect a device and try again.".to_string()
            }
            Error::RecorderFault(_) => {
                "Recording stopped unexpectedly. Your conversation has been kept.".to_string()
            }
            Error::Network(_) => "Connection problem. Check your network and retry.".to_string(),
            Error::Http { status } => format!("The server returned an error ({}).", status),
            Error::Unauthorized => "Your session has expired. Please sign in again.".to_string(),
            Error::StreamIncomplete => "The response was interrupted. Please retry.".to_string(),
            Error::Server { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.as_u16() == 401 => Error::Unauthorized,
            Some(status) => Error::Http {
                status: status.as_u16(),
            },
            None => Error::Network(err.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
