use chrono::{DateTime, Utc};
use serde::Serialize;

/// Assessment lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Initializing,
    Ready,
    InProgress,
    ClosureReady,
    Completing,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Learner,
    Interviewer,
    System,
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    pub speaker: Speaker,
    pub content: String,
    pub is_streaming: bool,
}

/// Everything the UI renders an assessment from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssessmentState {
    pub phase: Phase,

    pub attempt_id: Option<String>,
    pub assignment_id: Option<String>,
    pub objective_title: Option<String>,

    /// Append-only; only the streaming message changes in place
    pub messages: Vec<Message>,

    /// Between a send/start and the end of the reply stream
    pub is_waiting_for_response: bool,

    /// Last user-visible error
    pub error: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Set by the server's completion signal
    pub evaluation_id: Option<String>,

    /// Completion signalled while the farewell was still streaming
    pub completion_pending: bool,

    #[serde(skip)]
    pub(crate) next_message_id: u64,
}

impl AssessmentState {
    /// The message currently receiving tokens, if any
    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.is_streaming)
    }

    pub fn can_send(&self) -> bool {
        self.phase == Phase::InProgress
    }

    pub(crate) fn push_message(&mut self, speaker: Speaker, content: String, is_streaming: bool) {
        let id = format!("msg-{}", self.next_message_id);
        self.next_message_id += 1;
        self.messages.push(Message {
            id,
            speaker,
            content,
            is_streaming,
        });
    }

    pub(crate) fn streaming_message_mut(&mut self) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.is_streaming)
    }

    /// Close the streaming message, if any
    pub(crate) fn finalize_streaming(&mut self) {
        for message in self.messages.iter_mut().filter(|m| m.is_streaming) {
            message.is_streaming = false;
        }
    }
}
