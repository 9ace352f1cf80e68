use serde::{Deserialize, Deserializer};

use super::sse::SseFrame;
use crate::error::{Error, Result};

/// Identifiers carried by a `done` event
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DonePayload {
    #[serde(default, alias = "attemptId", deserialize_with = "id_string")]
    pub attempt_id: Option<String>,
    #[serde(default, alias = "assignmentId", deserialize_with = "id_string")]
    pub assignment_id: Option<String>,
    #[serde(default, alias = "objectiveTitle")]
    pub objective_title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct CompletePayload {
    #[serde(default, alias = "evaluationId", deserialize_with = "id_string")]
    evaluation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    message: String,
    #[serde(default)]
    recoverable: bool,
}

/// Decoded server event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token { content: String },
    Done(DonePayload),
    MessageDone,
    AssessmentComplete { evaluation_id: Option<String> },
    Error { message: String, recoverable: bool },
    Unknown { name: String },
}

impl StreamEvent {
    /// Decode a frame by event name
    ///
    /// A payload that does not match its event is `MalformedEventPayload`.
    pub fn decode(frame: &SseFrame) -> Result<Self> {
        let data = frame.data.trim();

        let event = match frame.event.as_str() {
            "token" => {
                let payload: TokenPayload = parse(&frame.event, data)?;
                StreamEvent::Token {
                    content: payload.content,
                }
            }
            "done" => {
                let payload: DonePayload = parse_or_default(&frame.event, data)?;
                StreamEvent::Done(payload)
            }
            "message_done" => StreamEvent::MessageDone,
            "assessment_complete" => {
                let payload: CompletePayload = parse_or_default(&frame.event, data)?;
                StreamEvent::AssessmentComplete {
                    evaluation_id: payload.evaluation_id,
                }
            }
            "error" => {
                let payload: ErrorPayload = parse(&frame.event, data)?;
                StreamEvent::Error {
                    message: payload.message,
                    recoverable: payload.recoverable,
                }
            }
            other => StreamEvent::Unknown {
                name: other.to_string(),
            },
        };

        Ok(event)
    }

    /// Ends a POST-initiated response stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done(_) | StreamEvent::MessageDone)
    }
}

fn parse<T: for<'de> Deserialize<'de>>(event: &str, data: &str) -> Result<T> {
    serde_json::from_str(data).map_err(|e| Error::MalformedEventPayload {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or_default<T: for<'de> Deserialize<'de> + Default>(event: &str, data: &str) -> Result<T> {
    if data.is_empty() {
        return Ok(T::default());
    }
    parse(event, data)
}

/// Accept identifiers sent as either strings or numbers
fn id_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
