use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::reducer::Action;
use super::state::{AssessmentState, Phase};
use super::store::AssessmentStore;
use crate::api::{ApiClient, EventBody};
use crate::error::{Error, Result};
use crate::media::Blob;
use crate::recording::{RecordingController, RecordingEvent, Visibility};
use crate::stream::{
    consume_event_source, consume_stream, StreamEvent, StreamOutcome, StreamSlot, StreamTicket,
};

/// Drives one learner's assessment
///
/// Coordinates the reducer, the recording controller and the API streams.
/// Every async entry point turns its failure into a `SetError` dispatch before
/// returning it; a 401 also clears the stored token.
pub struct AssessmentSession {
    store: AssessmentStore,
    api: ApiClient,
    recorder: Option<RecordingController>,
    /// POST reply streams
    replies: Arc<StreamSlot>,
    /// EventSource transport
    events: Arc<StreamSlot>,
    last_message: Mutex<Option<String>>,
    final_recording: Mutex<Option<Blob>>,
    max_duration_reached: Arc<AtomicBool>,
    recording_pump: Option<JoinHandle<()>>,
}

impl AssessmentSession {
    /// Session without recording
    pub fn new(api: ApiClient) -> Self {
        Self {
            store: AssessmentStore::new(),
            api,
            recorder: None,
            replies: Arc::new(StreamSlot::new()),
            events: Arc::new(StreamSlot::new()),
            last_message: Mutex::new(None),
            final_recording: Mutex::new(None),
            max_duration_reached: Arc::new(AtomicBool::new(false)),
            recording_pump: None,
        }
    }

    /// Session that records the learner and uploads chunks as they are produced
    pub fn with_recorder(
        api: ApiClient,
        recorder: RecordingController,
        recording_events: mpsc::UnboundedReceiver<RecordingEvent>,
    ) -> Self {
        let mut session = Self::new(api);
        session.recording_pump = Some(spawn_recording_pump(
            session.store.clone(),
            session.api.clone(),
            Arc::clone(&session.max_duration_reached),
            recording_events,
        ));
        session.recorder = Some(recorder);
        session
    }

    pub fn store(&self) -> &AssessmentStore {
        &self.store
    }

    pub fn state(&self) -> AssessmentState {
        self.store.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<AssessmentState> {
        self.store.subscribe()
    }

    pub fn recorder(&self) -> Option<&RecordingController> {
        self.recorder.as_ref()
    }

    /// Set once the recording hit its maximum duration; the caller decides what to do
    pub fn max_duration_reached(&self) -> bool {
        self.max_duration_reached.load(Ordering::SeqCst)
    }

    /// Bind a fresh state to `assignment_id`
    pub fn initialize(&self, assignment_id: &str) {
        self.replies.cancel();
        self.events.cancel();
        set(&self.last_message, None);
        set(&self.final_recording, None);
        self.max_duration_reached.store(false, Ordering::SeqCst);

        info!("Initializing assessment for assignment {}", assignment_id);
        self.store.dispatch(Action::Initialize {
            assignment_id: assignment_id.to_string(),
        });
    }

    /// Acquire camera/microphone; the assessment becomes ready once granted
    ///
    /// After a denied or failed request (error phase, or idle once the error
    /// was cleared) the request may be repeated for the same assignment.
    pub async fn grant_permissions(&self) -> Result<()> {
        let state = self.store.state();
        match state.phase {
            Phase::Initializing => {}
            Phase::Error | Phase::Idle if state.attempt_id.is_none() => {
                let Some(assignment_id) = state.assignment_id else {
                    return Err(Error::InvalidState("no assignment bound".into()));
                };
                info!("Re-requesting permissions for assignment {}", assignment_id);
                self.store.dispatch(Action::Initialize { assignment_id });
            }
            phase => {
                return Err(Error::InvalidState(format!(
                    "cannot grant permissions in {:?}",
                    phase
                )))
            }
        }

        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.initialize().await {
                return Err(self.fail(e));
            }
        }

        self.store.dispatch(Action::GrantPermissions);
        Ok(())
    }

    /// Start a new attempt and stream the orientation message
    ///
    /// The attempt identifiers arrive with the stream's `done` event.
    pub async fn start(&self) -> Result<()> {
        let state = self.store.state();
        if !matches!(state.phase, Phase::Ready | Phase::Initializing) {
            return Err(Error::InvalidState(format!("cannot start in {:?}", state.phase)));
        }
        let Some(assignment_id) = state.assignment_id else {
            return Err(Error::InvalidState("no assignment bound".into()));
        };

        self.store.dispatch(Action::StartAssessment {
            attempt_id: None,
            objective_title: None,
            started_at: Utc::now(),
        });
        self.start_recording().await?;

        let ticket = self.replies.begin();
        let body = match self.api.start_stream(&assignment_id).await {
            Ok(body) => body,
            Err(e) => return Err(self.stream_failed(&self.replies, &ticket, e)),
        };

        self.run_reply_stream(ticket, body).await
    }

    /// Start an attempt the server already created
    ///
    /// The orientation arrives over `follow_events`.
    pub async fn start_existing(&self, attempt_id: &str, objective_title: &str) -> Result<()> {
        let phase = self.store.state().phase;
        if !matches!(phase, Phase::Ready | Phase::Initializing) {
            return Err(Error::InvalidState(format!("cannot start in {:?}", phase)));
        }

        self.store
            .dispatch(Action::start_assessment(attempt_id, objective_title));
        self.start_recording().await
    }

    /// Append a learner message and stream the interviewer's reply
    ///
    /// No-op unless the assessment is in progress.
    pub async fn send_message(&self, content: &str) -> Result<()> {
        if !self.store.state().can_send() {
            debug!("Ignoring message outside an active conversation");
            return Ok(());
        }
        self.supersede_reply();
        if !self.store.dispatch(Action::SendMessage {
            content: content.to_string(),
        }) {
            return Ok(());
        }

        set(&self.last_message, Some(content.to_string()));
        self.store.dispatch(Action::BeginInterviewerMessage);
        self.stream_reply(content).await
    }

    /// Repeat whatever failed last
    ///
    /// Resends the last learner message. Before any message was sent it
    /// re-requests the orientation, or the permissions if the attempt never
    /// started.
    pub async fn retry(&self) -> Result<()> {
        let state = self.store.state();
        if state.phase != Phase::Error {
            return Err(Error::InvalidState(format!(
                "nothing to retry in {:?}",
                state.phase
            )));
        }
        let Some(content) = get(&self.last_message) else {
            return self.retry_start(state).await;
        };

        self.store.dispatch(Action::ClearError);
        if !self.store.state().can_send() {
            return Err(Error::InvalidState("attempt is not in progress".into()));
        }

        info!("Retrying last message");
        self.store.dispatch(Action::BeginInterviewerMessage);
        self.stream_reply(&content).await
    }

    async fn retry_start(&self, state: AssessmentState) -> Result<()> {
        if state.attempt_id.is_some() {
            info!("Resuming attempt without an orientation");
            self.store.dispatch(Action::ClearError);
            return Ok(());
        }
        if state.started_at.is_none() {
            return self.grant_permissions().await;
        }

        let Some(assignment_id) = state.assignment_id else {
            return Err(Error::InvalidState("no assignment bound".into()));
        };
        info!("Retrying start of assignment {}", assignment_id);
        self.store.dispatch(Action::Initialize { assignment_id });
        self.store.dispatch(Action::GrantPermissions);
        self.start().await
    }

    pub fn clear_error(&self) {
        self.store.dispatch(Action::ClearError);
    }

    /// Learner answers once more after the interviewer signalled the end
    pub fn continue_after_closure(&self) {
        self.store.dispatch(Action::ContinueAfterClosure);
    }

    /// Follow the EventSource transport until the server closes it
    pub async fn follow_events(&self) -> Result<()> {
        let Some(attempt_id) = self.store.state().attempt_id else {
            return Err(Error::InvalidState("attempt not identified".into()));
        };

        let ticket = self.events.begin();
        let body = match self.api.event_source(&attempt_id).await {
            Ok(body) => body,
            Err(e) => return Err(self.stream_failed(&self.events, &ticket, e)),
        };

        let store = self.store.clone();
        let slot = Arc::clone(&self.events);
        let generation = ticket.generation;
        let result = consume_event_source(body, &ticket.token, |event| {
            if slot.is_current(generation) {
                apply_event(&store, event);
            }
        })
        .await;

        match result {
            Ok(StreamOutcome::Cancelled) => Ok(()),
            Ok(StreamOutcome::Completed { .. }) => {
                self.events.finish(generation);
                info!("Event stream for attempt {} closed", attempt_id);
                Ok(())
            }
            Err(e) => Err(self.stream_failed(&self.events, &ticket, e)),
        }
    }

    pub async fn pause_recording(&self) {
        if let Some(recorder) = &self.recorder {
            recorder.pause_recording().await;
        }
    }

    pub async fn resume_recording(&self) {
        if let Some(recorder) = &self.recorder {
            recorder.resume_recording().await;
        }
    }

    pub async fn handle_visibility(&self, visibility: Visibility) {
        if let Some(recorder) = &self.recorder {
            recorder.handle_visibility(visibility).await;
        }
    }

    /// Stop recording, upload it and mark the attempt complete
    pub async fn finish(&self) -> Result<()> {
        let state = self.store.state();
        if !matches!(state.phase, Phase::InProgress | Phase::ClosureReady) {
            return Err(Error::InvalidState(format!("cannot finish in {:?}", state.phase)));
        }
        let Some(attempt_id) = state.attempt_id else {
            return Err(self.fail(Error::InvalidState("attempt not identified".into())));
        };

        self.supersede_reply();
        if self.events.cancel() {
            self.store.dispatch(Action::FinishStreamingMessage);
        }
        self.store.dispatch(Action::BeginCompletion);
        info!("Completing attempt {}", attempt_id);

        if let Some(blob) = self.finalize_recording().await {
            if let Err(e) = self.api.upload_video(&attempt_id, &blob).await {
                // Keep the recording so a retry can upload it again
                set(&self.final_recording, Some(blob));
                return Err(self.fail(e));
            }
        }

        if let Err(e) = self.api.complete(&attempt_id).await {
            return Err(self.fail(e));
        }

        self.store.dispatch(Action::CompleteAssessment {
            completed_at: Utc::now(),
        });
        info!("Attempt {} completed", attempt_id);
        Ok(())
    }

    /// Tear everything down without completing (navigation away)
    pub async fn abandon(&self) {
        self.supersede_reply();
        if self.events.cancel() {
            self.store.dispatch(Action::FinishStreamingMessage);
        }
        if let Some(recorder) = &self.recorder {
            recorder.abandon().await;
        }
        info!("Assessment session abandoned");
    }

    async fn start_recording(&self) -> Result<()> {
        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.start_recording().await {
                return Err(self.fail(e));
            }
        }
        Ok(())
    }

    async fn finalize_recording(&self) -> Option<Blob> {
        if let Some(blob) = take(&self.final_recording) {
            return Some(blob);
        }
        let recorder = self.recorder.as_ref()?;

        match recorder.stop_recording().await {
            Ok(blob) if blob.is_empty() => {
                debug!("Recording is empty; skipping upload");
                None
            }
            Ok(blob) => Some(blob),
            Err(e) => {
                warn!("No recording to upload: {}", e);
                None
            }
        }
    }

    async fn stream_reply(&self, content: &str) -> Result<()> {
        let Some(attempt_id) = self.store.state().attempt_id else {
            return Err(self.fail(Error::InvalidState("attempt not identified".into())));
        };

        let ticket = self.replies.begin();
        let body = match self.api.message_stream(&attempt_id, content).await {
            Ok(body) => body,
            Err(e) => return Err(self.stream_failed(&self.replies, &ticket, e)),
        };

        self.run_reply_stream(ticket, body).await
    }

    async fn run_reply_stream(&self, ticket: StreamTicket, body: EventBody) -> Result<()> {
        let store = self.store.clone();
        let slot = Arc::clone(&self.replies);
        let generation = ticket.generation;

        let result = consume_stream(body, &ticket.token, |event| {
            // A superseded stream must not touch the conversation
            if slot.is_current(generation) {
                apply_event(&store, event);
            }
        })
        .await;

        match result {
            Ok(StreamOutcome::Cancelled) => Ok(()),
            Ok(StreamOutcome::Completed { .. }) => {
                if self.replies.finish(generation) {
                    self.store.dispatch(Action::FinishStreamingMessage);
                }
                Ok(())
            }
            Err(e) => Err(self.stream_failed(&self.replies, &ticket, e)),
        }
    }

    /// Cancel a reply still streaming and close its placeholder
    fn supersede_reply(&self) {
        if self.replies.cancel() {
            debug!("Superseding the reply still streaming");
            self.store.dispatch(Action::FinishStreamingMessage);
        }
    }

    /// Only the current stream may surface its failure
    fn stream_failed(&self, slot: &StreamSlot, ticket: &StreamTicket, err: Error) -> Error {
        if slot.finish(ticket.generation) {
            self.fail(err)
        } else {
            debug!("Ignoring failure of superseded stream: {}", err);
            err
        }
    }

    fn fail(&self, err: Error) -> Error {
        report_failure(&self.store, &self.api, &err);
        err
    }
}

impl Drop for AssessmentSession {
    fn drop(&mut self) {
        self.replies.cancel();
        self.events.cancel();
        if let Some(pump) = self.recording_pump.take() {
            pump.abort();
        }
    }
}

fn apply_event(store: &AssessmentStore, event: &StreamEvent) {
    match event {
        StreamEvent::Token { content } => {
            // EventSource replies have no placeholder yet; no-op when one is streaming
            store.dispatch(Action::BeginInterviewerMessage);
            store.dispatch(Action::AppendToken {
                content: content.clone(),
            });
        }
        StreamEvent::Done(payload) => {
            store.dispatch(Action::AttemptIdentified {
                attempt_id: payload.attempt_id.clone(),
                assignment_id: payload.assignment_id.clone(),
                objective_title: payload.objective_title.clone(),
            });
            // The reply is complete even if the body stays open
            store.dispatch(Action::FinishStreamingMessage);
        }
        StreamEvent::MessageDone => {
            store.dispatch(Action::FinishStreamingMessage);
        }
        StreamEvent::AssessmentComplete { evaluation_id } => {
            info!("Server signalled assessment completion");
            store.dispatch(Action::AssessmentCompleteSignalled {
                evaluation_id: evaluation_id.clone(),
            });
        }
        StreamEvent::Error { .. } | StreamEvent::Unknown { .. } => {}
    }
}

fn report_failure(store: &AssessmentStore, api: &ApiClient, err: &Error) {
    error!("Assessment error: {}", err);
    if err.requires_logout() {
        warn!("Authorization rejected; logging out");
        if let Err(e) = api.tokens().clear() {
            error!("Failed to clear token: {}", e);
        }
    }
    store.dispatch(Action::SetError {
        message: err.user_message(),
    });
}

/// Upload chunks in sequence order as the recorder hands them off
///
/// Chunks produced before the attempt id is known are held back.
fn spawn_recording_pump(
    store: AssessmentStore,
    api: ApiClient,
    max_duration_reached: Arc<AtomicBool>,
    mut events: mpsc::UnboundedReceiver<RecordingEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: VecDeque<(Blob, u64)> = VecDeque::new();

        while let Some(event) = events.recv().await {
            match event {
                RecordingEvent::ChunkReady { blob, sequence } => {
                    pending.push_back((blob, sequence));
                    let Some(attempt_id) = store.state().attempt_id else {
                        debug!("Holding chunk {} until the attempt is identified", sequence);
                        continue;
                    };
                    while let Some((blob, sequence)) = pending.pop_front() {
                        if let Err(e) = api.upload_chunk(&attempt_id, &blob, sequence).await {
                            warn!("Chunk {} upload failed: {}", sequence, e);
                        }
                    }
                }
                RecordingEvent::MaxDurationReached => {
                    warn!("Maximum recording duration reached");
                    max_duration_reached.store(true, Ordering::SeqCst);
                }
                RecordingEvent::Failed(err) => report_failure(&store, &api, &err),
                RecordingEvent::StateChanged(state) => debug!("Recording state: {:?}", state),
            }
        }
    })
}

fn lock<T>(cell: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match cell.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn set<T>(cell: &Mutex<Option<T>>, value: Option<T>) {
    *lock(cell) = value;
}

fn take<T>(cell: &Mutex<Option<T>>) -> Option<T> {
    lock(cell).take()
}

fn get<T: Clone>(cell: &Mutex<Option<T>>) -> Option<T> {
    lock(cell).clone()
}
