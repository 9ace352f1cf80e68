// Assessment state transitions
//
// A pure function from (state, action) to the next state. Every action is
// guarded by the phases in which it is admissible; an inadmissible action
// returns the state unchanged.

use chrono::{DateTime, Utc};

use super::state::{AssessmentState, Phase, Speaker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Fresh state bound to an assignment
    Initialize { assignment_id: String },
    GrantPermissions,
    /// Identifiers may be unknown until the start stream's `done` event
    StartAssessment {
        attempt_id: Option<String>,
        objective_title: Option<String>,
        started_at: DateTime<Utc>,
    },
    /// Fills identifiers that are still unset
    AttemptIdentified {
        attempt_id: Option<String>,
        assignment_id: Option<String>,
        objective_title: Option<String>,
    },
    SendMessage { content: String },
    /// Placeholder for the interviewer's streamed reply
    BeginInterviewerMessage,
    AppendToken { content: String },
    FinishStreamingMessage,
    AddSystemMessage { content: String },
    AssessmentCompleteSignalled { evaluation_id: Option<String> },
    /// Learner answers once more after the interviewer closed
    ContinueAfterClosure,
    BeginCompletion,
    CompleteAssessment { completed_at: DateTime<Utc> },
    SetError { message: String },
    ClearError,
    Reset,
}

impl Action {
    pub fn start_assessment(attempt_id: impl Into<String>, objective_title: impl Into<String>) -> Self {
        Action::StartAssessment {
            attempt_id: Some(attempt_id.into()),
            objective_title: Some(objective_title.into()),
            started_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Initialize { .. } => "INITIALIZE",
            Action::GrantPermissions => "GRANT_PERMISSIONS",
            Action::StartAssessment { .. } => "START_ASSESSMENT",
            Action::AttemptIdentified { .. } => "ATTEMPT_IDENTIFIED",
            Action::SendMessage { .. } => "SEND_MESSAGE",
            Action::BeginInterviewerMessage => "BEGIN_INTERVIEWER_MESSAGE",
            Action::AppendToken { .. } => "APPEND_TOKEN",
            Action::FinishStreamingMessage => "FINISH_STREAMING_MESSAGE",
            Action::AddSystemMessage { .. } => "ADD_SYSTEM_MESSAGE",
            Action::AssessmentCompleteSignalled { .. } => "ASSESSMENT_COMPLETE",
            Action::ContinueAfterClosure => "CONTINUE_AFTER_CLOSURE",
            Action::BeginCompletion => "BEGIN_COMPLETION",
            Action::CompleteAssessment { .. } => "COMPLETE_ASSESSMENT",
            Action::SetError { .. } => "SET_ERROR",
            Action::ClearError => "CLEAR_ERROR",
            Action::Reset => "RESET",
        }
    }
}

pub fn reduce(state: &AssessmentState, action: &Action) -> AssessmentState {
    let mut next = state.clone();

    match action {
        Action::Initialize { assignment_id } => {
            return AssessmentState {
                phase: Phase::Initializing,
                assignment_id: Some(assignment_id.clone()),
                ..AssessmentState::default()
            };
        }

        Action::GrantPermissions => {
            if state.phase == Phase::Initializing {
                next.phase = Phase::Ready;
            }
        }

        Action::StartAssessment {
            attempt_id,
            objective_title,
            started_at,
        } => {
            if !matches!(state.phase, Phase::Ready | Phase::Initializing) {
                return next;
            }
            next.phase = Phase::InProgress;
            fill(&mut next.attempt_id, attempt_id);
            fill(&mut next.objective_title, objective_title);
            next.started_at = Some(*started_at);
            next.is_waiting_for_response = true;
            if next.streaming_message().is_none() {
                next.push_message(Speaker::Interviewer, String::new(), true);
            }
        }

        Action::AttemptIdentified {
            attempt_id,
            assignment_id,
            objective_title,
        } => {
            fill(&mut next.attempt_id, attempt_id);
            fill(&mut next.assignment_id, assignment_id);
            fill(&mut next.objective_title, objective_title);
        }

        Action::SendMessage { content } => {
            if state.phase != Phase::InProgress || content.trim().is_empty() {
                return next;
            }
            next.push_message(Speaker::Learner, content.clone(), false);
            next.is_waiting_for_response = true;
        }

        Action::BeginInterviewerMessage => {
            if state.phase != Phase::InProgress || state.streaming_message().is_some() {
                return next;
            }
            next.push_message(Speaker::Interviewer, String::new(), true);
            next.is_waiting_for_response = true;
        }

        Action::AppendToken { content } => {
            if let Some(message) = next.streaming_message_mut() {
                message.content.push_str(content);
            }
        }

        Action::FinishStreamingMessage => {
            next.finalize_streaming();
            next.is_waiting_for_response = false;
            if next.completion_pending && next.phase == Phase::InProgress {
                next.phase = Phase::ClosureReady;
                next.completion_pending = false;
            }
        }

        Action::AddSystemMessage { content } => {
            next.push_message(Speaker::System, content.clone(), false);
        }

        Action::AssessmentCompleteSignalled { evaluation_id } => {
            fill(&mut next.evaluation_id, evaluation_id);
            if state.phase == Phase::InProgress {
                if state.streaming_message().is_some() {
                    next.completion_pending = true;
                } else {
                    next.phase = Phase::ClosureReady;
                }
            }
        }

        Action::ContinueAfterClosure => {
            if state.phase == Phase::ClosureReady {
                next.phase = Phase::InProgress;
            }
        }

        Action::BeginCompletion => {
            if matches!(state.phase, Phase::InProgress | Phase::ClosureReady) {
                next.phase = Phase::Completing;
                next.is_waiting_for_response = false;
                next.completion_pending = false;
            }
        }

        Action::CompleteAssessment { completed_at } => {
            if state.phase == Phase::Completing {
                next.phase = Phase::Completed;
                next.completed_at = Some(*completed_at);
            }
        }

        Action::SetError { message } => {
            if state.phase == Phase::Completed {
                return next;
            }
            next.phase = Phase::Error;
            next.error = Some(message.clone());
            next.is_waiting_for_response = false;
            next.finalize_streaming();
        }

        Action::ClearError => {
            if state.error.is_none() {
                return next;
            }
            next.error = None;
            next.phase = if state.attempt_id.is_some() {
                Phase::InProgress
            } else {
                Phase::Idle
            };
        }

        Action::Reset => return AssessmentState::default(),
    }

    next
}

/// Set once; later values are ignored
fn fill(slot: &mut Option<String>, value: &Option<String>) {
    if slot.is_none() {
        slot.clone_from(value);
    }
}
