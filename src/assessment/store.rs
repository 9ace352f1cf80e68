use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use super::reducer::{reduce, Action};
use super::state::AssessmentState;

/// Serialized dispatch over the assessment reducer
///
/// Every dispatch is applied under the channel's write lock, one at a time.
/// Subscribers are woken only when an action changed the state.
#[derive(Clone)]
pub struct AssessmentStore {
    tx: Arc<watch::Sender<AssessmentState>>,
}

impl AssessmentStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AssessmentState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Apply `action`; returns whether the state changed
    pub fn dispatch(&self, action: Action) -> bool {
        let name = action.name();
        self.tx.send_if_modified(|state| {
            let next = reduce(state, &action);
            if next == *state {
                debug!("{} ignored in {:?}", name, state.phase);
                return false;
            }
            if next.phase != state.phase {
                debug!("{}: {:?} -> {:?}", name, state.phase, next.phase);
            }
            *state = next;
            true
        })
    }

    /// Current state
    pub fn state(&self) -> AssessmentState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AssessmentState> {
        self.tx.subscribe()
    }
}

impl Default for AssessmentStore {
    fn default() -> Self {
        Self::new()
    }
}
