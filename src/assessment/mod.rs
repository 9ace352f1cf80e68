//! Assessment conversation lifecycle
//!
//! `reducer` is the pure state machine; `store` serializes dispatches and
//! notifies subscribers; `session` wires the store to the recording
//! controller and the API streams.

mod reducer;
mod session;
mod state;
mod store;

pub use reducer::{reduce, Action};
pub use session::AssessmentSession;
pub use state::{AssessmentState, Message, Phase, Speaker};
pub use store::AssessmentStore;
