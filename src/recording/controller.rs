use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::RecordingOptions;
use super::state::{RecordingEvent, RecordingSnapshot, RecordingState, Visibility};
use crate::error::{Error, Result};
use crate::media::{Blob, MediaCaptureSession, MediaStream};

/// State machine layered on a capture session
///
/// Adds duration accounting, the max-duration notification, periodic chunk
/// hand-off for progressive upload, and automatic pause while the page is
/// hidden. Clones share the same session.
#[derive(Clone)]
pub struct RecordingController {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    id: Uuid,
    options: RecordingOptions,
    capture: MediaCaptureSession,
    audio_override: Option<MediaStream>,
    events: mpsc::UnboundedSender<RecordingEvent>,
    state: RecordingState,
    accumulated: Duration,
    active_since: Option<Instant>,
    last_flushed_index: usize,
    next_sequence: u64,
    max_duration_fired: bool,
    paused_by_visibility: bool,
    error: Option<Error>,
    timers: Timers,
}

/// Background tasks owned by one controller
#[derive(Default)]
struct Timers {
    max_duration: Option<JoinHandle<()>>,
    chunk_flush: Option<JoinHandle<()>>,
    visibility_resume: Option<JoinHandle<()>>,
    fault_watch: Option<JoinHandle<()>>,
}

impl Timers {
    fn cancel(slot: &mut Option<JoinHandle<()>>) {
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    fn clear_recording(&mut self) {
        Self::cancel(&mut self.max_duration);
        Self::cancel(&mut self.chunk_flush);
    }

    fn clear_visibility(&mut self) {
        Self::cancel(&mut self.visibility_resume);
    }

    fn clear_all(&mut self) {
        self.clear_recording();
        self.clear_visibility();
        Self::cancel(&mut self.fault_watch);
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.clear_all();
    }
}

impl Inner {
    fn emit(&self, event: RecordingEvent) {
        // Receiver may be gone during teardown
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: RecordingState) {
        if self.state == state {
            return;
        }
        debug!("Recording {}: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
        self.emit(RecordingEvent::StateChanged(state));
    }

    fn duration(&self) -> Duration {
        self.accumulated + self.active_since.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Stop counting time and cancel recording timers
    fn suspend(&mut self) {
        if let Some(since) = self.active_since.take() {
            self.accumulated += since.elapsed();
        }
        self.timers.clear_recording();
    }

    /// Hand every chunk produced since the last flush to the upload side
    fn flush_pending(&mut self) {
        let pending = self.capture.chunks_from(self.last_flushed_index);
        if pending.is_empty() {
            return;
        }

        self.last_flushed_index += pending.len();
        let blob = Blob::concat(&pending, self.capture.mime_type());
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        debug!(
            "Recording {}: chunk {} ready ({} bytes, flushed through {})",
            self.id,
            sequence,
            blob.len(),
            self.last_flushed_index
        );
        self.emit(RecordingEvent::ChunkReady { blob, sequence });
    }

    /// Tear down timers, encoder and tracks, and clear per-session counters
    fn discard(&mut self) {
        self.timers.clear_all();
        self.capture.reset();
        self.capture.release_tracks();
        self.accumulated = Duration::ZERO;
        self.active_since = None;
        self.last_flushed_index = 0;
        self.next_sequence = 0;
        self.max_duration_fired = false;
        self.paused_by_visibility = false;
    }

    fn fail(&mut self, err: Error) {
        error!("Recording {} failed: {}", self.id, err);
        self.suspend();
        self.timers.clear_all();
        self.capture.reset();
        self.capture.release_tracks();
        self.paused_by_visibility = false;
        self.error = Some(err.clone());
        self.set_state(RecordingState::Error);
        self.emit(RecordingEvent::Failed(err));
    }
}

impl RecordingController {
    /// Create a controller and the receiver for its events
    pub fn new(
        capture: MediaCaptureSession,
        options: RecordingOptions,
    ) -> (Self, mpsc::UnboundedReceiver<RecordingEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        info!(
            "Recording controller {} created (max duration {}s, chunk upload every {}ms)",
            id,
            options.max_duration.as_secs(),
            options.chunk_upload_interval.as_millis()
        );

        let inner = Inner {
            id,
            options,
            capture,
            audio_override: None,
            events,
            state: RecordingState::Idle,
            accumulated: Duration::ZERO,
            active_since: None,
            last_flushed_index: 0,
            next_sequence: 0,
            max_duration_fired: false,
            paused_by_visibility: false,
            error: None,
            timers: Timers::default(),
        };

        (
            Self {
                inner: Arc::new(Mutex::new(inner)),
            },
            events_rx,
        )
    }

    /// Audio source recorded instead of the microphone on the next initialize
    pub async fn set_audio_override(&self, stream: Option<MediaStream>) {
        self.inner.lock().await.audio_override = stream;
    }

    /// Acquire devices and start the encoder
    ///
    /// Lands in `Ready` (encoder paused) unless `auto_start` is set.
    pub async fn initialize(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        match inner.state {
            RecordingState::Idle
            | RecordingState::Error
            | RecordingState::Completed
            | RecordingState::Abandoned => {
                let auto_start = inner.options.auto_start;
                initialize_session(&self.inner, inner, auto_start).await
            }
            other => {
                warn!("Ignoring initialize in {:?}", other);
                Ok(())
            }
        }
    }

    pub async fn start_recording(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        match inner.state {
            RecordingState::Ready => {
                inner.capture.resume();
                begin_active(&self.inner, inner);
                info!("Recording {} started", inner.id);
                Ok(())
            }
            RecordingState::Idle
            | RecordingState::Error
            | RecordingState::Completed
            | RecordingState::Abandoned => initialize_session(&self.inner, inner, true).await,
            RecordingState::Recording => {
                debug!("Recording {} already running", inner.id);
                Ok(())
            }
            other => Err(Error::InvalidState(format!(
                "cannot start recording from {:?}",
                other
            ))),
        }
    }

    /// User-initiated pause
    ///
    /// Also cancels a pending visibility auto-resume.
    pub async fn pause_recording(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        match inner.state {
            RecordingState::Recording => {
                inner.suspend();
                inner.capture.pause();
                inner.paused_by_visibility = false;
                inner.timers.clear_visibility();
                inner.set_state(RecordingState::Paused);
                info!("Recording {} paused at {:.1}s", inner.id, inner.duration().as_secs_f64());
            }
            RecordingState::Paused => {
                if inner.paused_by_visibility {
                    debug!("Manual pause overrides visibility pause");
                }
                inner.paused_by_visibility = false;
                inner.timers.clear_visibility();
            }
            other => warn!("Ignoring pause in {:?}", other),
        }
    }

    pub async fn resume_recording(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        match inner.state {
            RecordingState::Paused => {
                inner.paused_by_visibility = false;
                inner.timers.clear_visibility();
                inner.capture.resume();
                begin_active(&self.inner, inner);
                info!("Recording {} resumed", inner.id);
            }
            other => warn!("Ignoring resume in {:?}", other),
        }
    }

    /// Host page visibility changed
    pub async fn handle_visibility(&self, visibility: Visibility) {
        let mut guard = self.inner.lock().await;
        visibility_changed(&self.inner, &mut guard, visibility);
    }

    /// Forward visibility changes from the host until the sender is dropped
    pub fn attach_visibility(&self, mut visibility_rx: watch::Receiver<Visibility>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            while visibility_rx.changed().await.is_ok() {
                let visibility = *visibility_rx.borrow_and_update();
                let Some(this) = weak.upgrade() else {
                    break;
                };
                let mut guard = this.lock().await;
                visibility_changed(&this, &mut guard, visibility);
            }
        })
    }

    /// Finalize the recording
    ///
    /// Unflushed chunks go out as one last `ChunkReady` before the state
    /// becomes `Completed`. With chunk upload disabled nothing is flushed, so
    /// `last_flushed_index` stays behind `chunk_count`; the returned blob
    /// holds every chunk either way.
    pub async fn stop_recording(&self) -> Result<Blob> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if !inner.state.is_active() {
            return Err(Error::InvalidState(format!(
                "cannot stop recording from {:?}",
                inner.state
            )));
        }

        inner.set_state(RecordingState::Stopping);
        inner.suspend();
        inner.timers.clear_all();
        inner.paused_by_visibility = false;

        let blob = match inner.capture.stop().await {
            Ok(blob) => blob,
            Err(e) => {
                inner.fail(e.clone());
                return Err(e);
            }
        };

        if inner.options.chunk_upload_enabled() {
            inner.flush_pending();
        }

        inner.set_state(RecordingState::Completed);
        info!(
            "Recording {} completed: {:.1}s, {} bytes",
            inner.id,
            inner.duration().as_secs_f64(),
            blob.len()
        );

        Ok(blob)
    }

    /// Release hardware immediately and drop the session without completing it
    pub async fn abandon(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if inner.state != RecordingState::Abandoned {
            info!("Recording {} abandoned in {:?}", inner.id, inner.state);
        }
        inner.discard();
        inner.set_state(RecordingState::Abandoned);
    }

    /// Back to `Idle`, discarding chunks and any error
    pub async fn reset(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        inner.discard();
        inner.error = None;
        inner.set_state(RecordingState::Idle);
    }

    pub async fn snapshot(&self) -> RecordingSnapshot {
        let inner = self.inner.lock().await;
        RecordingSnapshot {
            state: inner.state,
            duration: inner.duration(),
            chunk_count: inner.capture.chunk_count(),
            last_flushed_index: inner.last_flushed_index,
            next_sequence: inner.next_sequence,
            paused_by_visibility: inner.paused_by_visibility,
            error: inner.error.clone(),
        }
    }

    pub async fn state(&self) -> RecordingState {
        self.inner.lock().await.state
    }

    /// Raw camera/microphone stream for preview
    pub async fn preview_stream(&self) -> Option<MediaStream> {
        self.inner.lock().await.capture.preview_stream().cloned()
    }
}

async fn initialize_session(this: &Arc<Mutex<Inner>>, inner: &mut Inner, start: bool) -> Result<()> {
    inner.discard();
    inner.error = None;
    inner.set_state(RecordingState::Initializing);

    let stream = match inner.capture.acquire(inner.options.constraints).await {
        Ok(stream) => stream,
        Err(e) => {
            inner.fail(e.clone());
            return Err(e);
        }
    };

    let audio_override = inner.audio_override.clone();
    if let Err(e) = inner.capture.start_encoding(&stream, audio_override.as_ref()) {
        inner.fail(e.clone());
        return Err(e);
    }

    watch_faults(this, inner);

    if start {
        begin_active(this, inner);
        info!("Recording {} started", inner.id);
    } else {
        inner.capture.pause();
        inner.set_state(RecordingState::Ready);
        info!("Recording {} ready", inner.id);
    }

    Ok(())
}

/// Enter `Recording` and arm the recording timers
fn begin_active(this: &Arc<Mutex<Inner>>, inner: &mut Inner) {
    inner.active_since = Some(Instant::now());
    inner.set_state(RecordingState::Recording);
    schedule_max_duration(this, inner);
    schedule_chunk_flush(this, inner);
}

fn schedule_max_duration(this: &Arc<Mutex<Inner>>, inner: &mut Inner) {
    let limit = inner.options.max_duration;
    if limit.is_zero() || inner.max_duration_fired {
        return;
    }

    let remaining = limit.saturating_sub(inner.duration());
    let weak = Arc::downgrade(this);

    inner.timers.max_duration = Some(tokio::spawn(async move {
        sleep(remaining).await;
        let Some(this) = weak.upgrade() else {
            return;
        };
        let mut inner = this.lock().await;
        if inner.state == RecordingState::Recording && !inner.max_duration_fired {
            inner.max_duration_fired = true;
            info!("Recording {} reached max duration", inner.id);
            inner.emit(RecordingEvent::MaxDurationReached);
        }
    }));
}

fn schedule_chunk_flush(this: &Arc<Mutex<Inner>>, inner: &mut Inner) {
    if !inner.options.chunk_upload_enabled() {
        return;
    }

    let period = inner.options.chunk_upload_interval;
    let weak = Arc::downgrade(this);

    inner.timers.chunk_flush = Some(tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let Some(this) = weak.upgrade() else {
                break;
            };
            let mut inner = this.lock().await;
            if inner.state != RecordingState::Recording {
                break;
            }
            inner.flush_pending();
        }
    }));
}

fn watch_faults(this: &Arc<Mutex<Inner>>, inner: &mut Inner) {
    let Some(mut faults) = inner.capture.take_error_channel() else {
        return;
    };
    let weak: Weak<Mutex<Inner>> = Arc::downgrade(this);

    inner.timers.fault_watch = Some(tokio::spawn(async move {
        let Some(err) = faults.recv().await else {
            return;
        };
        let Some(this) = weak.upgrade() else {
            return;
        };
        let mut inner = this.lock().await;
        // Detach ourselves so fail() does not abort this task
        inner.timers.fault_watch.take();
        if inner.state.is_active() {
            inner.fail(err);
        }
    }));
}

fn visibility_changed(this: &Arc<Mutex<Inner>>, inner: &mut Inner, visibility: Visibility) {
    match visibility {
        Visibility::Hidden => {
            inner.timers.clear_visibility();
            if inner.state == RecordingState::Recording {
                inner.suspend();
                inner.capture.pause();
                inner.paused_by_visibility = true;
                inner.set_state(RecordingState::Paused);
                info!("Recording {} paused: page hidden", inner.id);
            }
        }
        Visibility::Visible => {
            if inner.state == RecordingState::Paused && inner.paused_by_visibility {
                schedule_visibility_resume(this, inner);
            }
        }
    }
}

fn schedule_visibility_resume(this: &Arc<Mutex<Inner>>, inner: &mut Inner) {
    let delay = inner.options.visibility_resume_delay;
    let weak = Arc::downgrade(this);

    inner.timers.clear_visibility();
    inner.timers.visibility_resume = Some(tokio::spawn(async move {
        sleep(delay).await;
        let Some(this) = weak.upgrade() else {
            return;
        };
        let mut guard = this.lock().await;
        let inner = &mut *guard;
        inner.timers.visibility_resume.take();

        // A manual pause or resume during the delay wins
        if inner.state == RecordingState::Paused && inner.paused_by_visibility {
            inner.paused_by_visibility = false;
            inner.capture.resume();
            begin_active(&this, inner);
            info!("Recording {} resumed: page visible", inner.id);
        }
    }));
}
