// Integration tests for the assessment session against an in-process API
//
// A small axum server plays the assessment backend: it streams SSE replies in
// awkward pieces, records uploads, and rejects unknown bearer tokens.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use assessment_session::api::{ApiClient, TokenStore};
use assessment_session::assessment::{AssessmentSession, Phase, Speaker};
use assessment_session::media::{
    MediaCaptureSession, PermissionOutcome, SyntheticDevices, SyntheticEncoder,
};
use assessment_session::recording::{RecordingController, RecordingOptions, RecordingState};
use assessment_session::Error;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, StreamExt};
use tempfile::TempDir;

const TOKEN: &str = "good-token";

#[derive(Default)]
struct Backend {
    started: Mutex<Vec<String>>,
    messages: Mutex<Vec<String>>,
    /// Message requests whose reply is cut off before `done`
    truncate_replies: AtomicUsize,
    /// Start requests whose orientation is cut off before `done`
    truncate_starts: AtomicUsize,
    chunk_sequences: Mutex<Vec<u64>>,
    video: Mutex<Option<Bytes>>,
    completed: Mutex<Vec<String>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", TOKEN))
        .unwrap_or(false)
}

/// SSE body delivered in the given pieces
fn sse(pieces: Vec<String>) -> Response {
    let body = stream::iter(pieces.into_iter().map(Ok::<_, std::io::Error>));
    ([(CONTENT_TYPE, "text/event-stream")], Body::from_stream(body)).into_response()
}

/// SSE body that stays open after the given pieces
fn open_sse(pieces: Vec<String>) -> Response {
    let body = stream::iter(pieces.into_iter().map(Ok::<_, std::io::Error>))
        .chain(stream::pending());
    ([(CONTENT_TYPE, "text/event-stream")], Body::from_stream(body)).into_response()
}

fn token(content: &str) -> String {
    format!("event: token\ndata: {}\n\n", serde_json::json!({ "content": content }))
}

/// Value of a plain multipart text field
fn form_field(body: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let marker = format!("name=\"{}\"\r\n\r\n", name);
    let start = text.find(&marker)? + marker.len();
    let end = text[start..].find("\r\n")? + start;
    Some(text[start..end].to_string())
}

async fn start(
    State(backend): State<Arc<Backend>>,
    Path(assignment_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    backend.started.lock().unwrap().push(assignment_id.clone());

    let truncate = backend
        .truncate_starts
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if truncate {
        return sse(vec![token("Welc")]);
    }

    // Split mid-record and mid-line on purpose
    let mut text = token("Welcome.");
    text.push_str(&token(" Let's begin."));
    text.push_str(&format!(
        "event: done\ndata: {{\"attemptId\":\"T1\",\"assignmentId\":\"{}\",\"objectiveTitle\":\"Fractions\"}}\n\n",
        assignment_id
    ));
    let pieces = text
        .as_bytes()
        .chunks(7)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    sse(pieces)
}

async fn message(
    State(backend): State<Arc<Backend>>,
    Path(_attempt_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let content = body["content"].as_str().unwrap_or_default().to_string();
    backend.messages.lock().unwrap().push(content.clone());

    match content.as_str() {
        // Reply that never finishes
        "slow" => return open_sse(vec![token("Partial")]),
        // Finished reply on a connection the server keeps open
        "linger" => {
            return open_sse(vec![
                token("Noted."),
                "event: done\ndata: {\"attemptId\":\"T1\"}\n\n".to_string(),
            ])
        }
        _ => {}
    }

    let mut pieces: Vec<String> = ["The", " answer", " is", " four."]
        .iter()
        .map(|t| token(t))
        .collect();

    let truncate = backend
        .truncate_replies
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if truncate {
        pieces.truncate(1);
    } else {
        pieces.push("event: done\ndata: {\"attemptId\":\"T1\"}\n\n".to_string());
    }
    sse(pieces)
}

async fn events(
    Path(_attempt_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if query.get("token").map(String::as_str) != Some(TOKEN) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    sse(vec![
        token("Let's look at ratios."),
        "event: message_done\n\n".to_string(),
        ": keep-alive\n\n".to_string(),
        "event: assessment_complete\ndata: {\"evaluationId\":42}\n\n".to_string(),
    ])
}

async fn chunk(
    State(backend): State<Arc<Backend>>,
    Path(_attempt_id): Path<String>,
    body: Bytes,
) -> StatusCode {
    match form_field(&body, "sequence").and_then(|s| s.parse().ok()) {
        Some(sequence) => {
            backend.chunk_sequences.lock().unwrap().push(sequence);
            StatusCode::OK
        }
        None => StatusCode::BAD_REQUEST,
    }
}

async fn video(
    State(backend): State<Arc<Backend>>,
    Path(_attempt_id): Path<String>,
    body: Bytes,
) -> StatusCode {
    *backend.video.lock().unwrap() = Some(body);
    StatusCode::OK
}

async fn complete(
    State(backend): State<Arc<Backend>>,
    Path(attempt_id): Path<String>,
) -> Json<serde_json::Value> {
    backend.completed.lock().unwrap().push(attempt_id);
    Json(serde_json::json!({ "status": "completed" }))
}

async fn serve(backend: Arc<Backend>) -> Result<SocketAddr> {
    let app = Router::new()
        .route("/api/assessments/:id/start", post(start))
        .route("/api/assessments/:id/message", post(message))
        .route("/api/assessments/:id/stream", get(events))
        .route("/api/assessments/:id/video/chunks", post(chunk))
        .route("/api/assessments/:id/video", post(video))
        .route("/api/assessments/:id/complete", post(complete))
        .with_state(backend);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

struct Fixture {
    backend: Arc<Backend>,
    api: ApiClient,
    _dir: TempDir,
}

async fn fixture(token: &str) -> Result<Fixture> {
    let backend = Arc::new(Backend::default());
    let addr = serve(Arc::clone(&backend)).await?;

    let dir = TempDir::new()?;
    let path = dir.path().join("token");
    let tokens = TokenStore::new(path.to_str().unwrap())?;
    tokens.save(token)?;

    let api = ApiClient::new(&format!("http://{}", addr), tokens, Duration::from_secs(5))?;
    Ok(Fixture {
        backend,
        api,
        _dir: dir,
    })
}

async fn started(session: &AssessmentSession) -> Result<()> {
    session.initialize("A1");
    session.grant_permissions().await?;
    session.start().await?;
    Ok(())
}

#[tokio::test]
async fn test_start_streams_orientation_and_identifies_attempt() -> Result<()> {
    let fx = fixture(TOKEN).await?;
    let session = AssessmentSession::new(fx.api.clone());

    started(&session).await?;

    let state = session.state();
    assert_eq!(state.phase, Phase::InProgress);
    assert_eq!(state.attempt_id.as_deref(), Some("T1"));
    assert_eq!(state.assignment_id.as_deref(), Some("A1"));
    assert_eq!(state.objective_title.as_deref(), Some("Fractions"));
    assert!(state.started_at.is_some());
    assert!(!state.is_waiting_for_response);

    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].speaker, Speaker::Interviewer);
    assert_eq!(state.messages[0].content, "Welcome. Let's begin.");
    assert!(!state.messages[0].is_streaming);

    assert_eq!(*fx.backend.started.lock().unwrap(), vec!["A1".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_send_message_streams_reply_after_learner_turn() -> Result<()> {
    let fx = fixture(TOKEN).await?;
    let session = AssessmentSession::new(fx.api.clone());
    started(&session).await?;

    session.send_message("two").await?;

    let state = session.state();
    let turns: Vec<_> = state
        .messages
        .iter()
        .map(|m| (m.speaker, m.content.as_str(), m.is_streaming))
        .collect();
    assert_eq!(
        turns,
        vec![
            (Speaker::Interviewer, "Welcome. Let's begin.", false),
            (Speaker::Learner, "two", false),
            (Speaker::Interviewer, "The answer is four.", false),
        ]
    );
    assert!(!state.is_waiting_for_response);
    assert_eq!(*fx.backend.messages.lock().unwrap(), vec!["two".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_messages_outside_progress_are_ignored() -> Result<()> {
    let fx = fixture(TOKEN).await?;
    let session = AssessmentSession::new(fx.api.clone());
    session.initialize("A1");

    session.send_message("too early").await?;

    assert!(session.state().messages.is_empty());
    assert!(fx.backend.messages.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_truncated_reply_sets_error_and_retry_recovers() -> Result<()> {
    let fx = fixture(TOKEN).await?;
    let session = AssessmentSession::new(fx.api.clone());
    started(&session).await?;
    fx.backend.truncate_replies.store(1, Ordering::SeqCst);

    let err = session.send_message("two").await.unwrap_err();
    assert_eq!(err, Error::StreamIncomplete);

    let state = session.state();
    assert_eq!(state.phase, Phase::Error);
    assert!(state.error.is_some());
    assert!(state.streaming_message().is_none());
    assert_eq!(state.messages[1].content, "two", "Messages survive the error");

    session.retry().await?;

    let state = session.state();
    assert_eq!(state.phase, Phase::InProgress);
    assert!(state.error.is_none());
    let last = state.messages.last().unwrap();
    assert_eq!(last.speaker, Speaker::Interviewer);
    assert_eq!(last.content, "The answer is four.");
    assert_eq!(
        *fx.backend.messages.lock().unwrap(),
        vec!["two".to_string(), "two".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn test_unauthorized_clears_token_and_sets_error() -> Result<()> {
    let fx = fixture("expired").await?;
    let session = AssessmentSession::new(fx.api.clone());
    session.initialize("A1");
    session.grant_permissions().await?;

    let err = session.start().await.unwrap_err();

    assert_eq!(err, Error::Unauthorized);
    assert_eq!(session.state().phase, Phase::Error);
    assert_eq!(fx.api.tokens().load()?, None, "401 logs the user out");
    Ok(())
}

#[tokio::test]
async fn test_event_source_transport_reaches_closure() -> Result<()> {
    let fx = fixture(TOKEN).await?;
    let session = AssessmentSession::new(fx.api.clone());
    session.initialize("A1");
    session.grant_permissions().await?;
    session.start_existing("T9", "Ratios").await?;

    session.follow_events().await?;

    let state = session.state();
    assert_eq!(state.phase, Phase::ClosureReady);
    assert_eq!(state.evaluation_id.as_deref(), Some("42"));
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].content, "Let's look at ratios.");
    assert!(!state.messages[0].is_streaming);

    // The learner may still add one more answer
    session.continue_after_closure();
    assert!(session.state().can_send());
    Ok(())
}

#[tokio::test]
async fn test_recorded_assessment_uploads_chunks_and_video() -> Result<()> {
    let fx = fixture(TOKEN).await?;
    let capture = MediaCaptureSession::new(
        Arc::new(SyntheticDevices::granting()),
        Box::new(SyntheticEncoder::new(Duration::from_millis(20))),
    );
    let (recorder, recording_events) = RecordingController::new(
        capture,
        RecordingOptions {
            chunk_upload_interval: Duration::from_millis(50),
            ..RecordingOptions::default()
        },
    );
    let session = AssessmentSession::with_recorder(fx.api.clone(), recorder, recording_events);

    session.initialize("A1");
    session.grant_permissions().await?;
    assert_eq!(
        session.recorder().unwrap().state().await,
        RecordingState::Ready
    );

    session.start().await?;
    assert_eq!(
        session.recorder().unwrap().state().await,
        RecordingState::Recording
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    session.send_message("two").await?;
    session.finish().await?;

    let state = session.state();
    assert_eq!(state.phase, Phase::Completed);
    assert!(state.completed_at.is_some());
    assert_eq!(
        session.recorder().unwrap().state().await,
        RecordingState::Completed
    );

    let video = fx.backend.video.lock().unwrap().clone().expect("video uploaded");
    assert!(video
        .windows(11)
        .any(|w| w == SyntheticEncoder::chunk_payload(0).as_slice()));
    assert_eq!(*fx.backend.completed.lock().unwrap(), vec!["T1".to_string()]);

    // Chunk uploads run in the background
    tokio::time::sleep(Duration::from_millis(200)).await;
    let sequences = fx.backend.chunk_sequences.lock().unwrap().clone();
    assert!(!sequences.is_empty());
    let expected: Vec<u64> = (0..sequences.len() as u64).collect();
    assert_eq!(sequences, expected, "Chunks arrive gap-free and in order");
    Ok(())
}

#[tokio::test]
async fn test_finish_outside_conversation_is_rejected() -> Result<()> {
    let fx = fixture(TOKEN).await?;
    let session = AssessmentSession::new(fx.api.clone());
    session.initialize("A1");

    let err = session.finish().await.unwrap_err();

    assert!(matches!(err, Error::InvalidState(_)));
    assert_eq!(session.state().phase, Phase::Initializing);
    assert!(fx.backend.completed.lock().unwrap().is_empty());
    Ok(())
}

fn turns(session: &AssessmentSession) -> Vec<(Speaker, String, bool)> {
    session
        .state()
        .messages
        .iter()
        .map(|m| (m.speaker, m.content.clone(), m.is_streaming))
        .collect()
}

#[tokio::test]
async fn test_new_message_supersedes_reply_still_streaming() -> Result<()> {
    let fx = fixture(TOKEN).await?;
    let session = Arc::new(AssessmentSession::new(fx.api.clone()));
    started(&session).await?;

    let first = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.send_message("slow").await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    session.send_message("two").await?;
    first.await??;

    assert_eq!(
        turns(&session),
        vec![
            (Speaker::Interviewer, "Welcome. Let's begin.".to_string(), false),
            (Speaker::Learner, "slow".to_string(), false),
            (Speaker::Interviewer, "Partial".to_string(), false),
            (Speaker::Learner, "two".to_string(), false),
            (Speaker::Interviewer, "The answer is four.".to_string(), false),
        ]
    );
    assert!(!session.state().is_waiting_for_response);
    Ok(())
}

#[tokio::test]
async fn test_finish_closes_reply_still_streaming() -> Result<()> {
    let fx = fixture(TOKEN).await?;
    let session = Arc::new(AssessmentSession::new(fx.api.clone()));
    started(&session).await?;

    let pending = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.send_message("slow").await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    session.finish().await?;
    pending.await??;

    let state = session.state();
    assert_eq!(state.phase, Phase::Completed);
    assert!(state.streaming_message().is_none());
    assert_eq!(state.messages.last().unwrap().content, "Partial");
    Ok(())
}

#[tokio::test]
async fn test_done_finishes_reply_while_body_stays_open() -> Result<()> {
    let fx = fixture(TOKEN).await?;
    let session = Arc::new(AssessmentSession::new(fx.api.clone()));
    started(&session).await?;

    let reply = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.send_message("linger").await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let state = session.state();
    assert!(!state.is_waiting_for_response);
    let last = state.messages.last().unwrap();
    assert_eq!(last.content, "Noted.");
    assert!(!last.is_streaming);
    assert!(state.can_send());

    reply.abort();
    Ok(())
}

#[tokio::test]
async fn test_recorder_fault_sets_error_and_keeps_conversation() -> Result<()> {
    let fx = fixture(TOKEN).await?;
    let capture = MediaCaptureSession::new(
        Arc::new(SyntheticDevices::granting()),
        Box::new(SyntheticEncoder::new(Duration::from_millis(100)).with_fault_after(2)),
    );
    let (recorder, recording_events) = RecordingController::new(
        capture,
        RecordingOptions {
            chunk_upload_interval: Duration::ZERO,
            ..RecordingOptions::default()
        },
    );
    let session = AssessmentSession::with_recorder(fx.api.clone(), recorder, recording_events);
    started(&session).await?;

    tokio::time::sleep(Duration::from_millis(600)).await;

    let state = session.state();
    assert_eq!(state.phase, Phase::Error);
    assert!(state.error.is_some());
    assert_eq!(state.attempt_id.as_deref(), Some("T1"));
    assert_eq!(
        turns(&session),
        vec![(Speaker::Interviewer, "Welcome. Let's begin.".to_string(), false)],
        "Conversation survives the recorder fault"
    );
    assert_eq!(
        session.recorder().unwrap().state().await,
        RecordingState::Error
    );

    // The conversation can go on without the recording
    session.clear_error();
    session.send_message("two").await?;
    assert_eq!(session.state().messages.last().unwrap().content, "The answer is four.");
    Ok(())
}

#[tokio::test]
async fn test_permissions_can_be_requested_again_after_denial() -> Result<()> {
    let fx = fixture(TOKEN).await?;
    let devices = Arc::new(SyntheticDevices::new(PermissionOutcome::Deny));
    let capture = MediaCaptureSession::new(
        devices.clone(),
        Box::new(SyntheticEncoder::new(Duration::from_millis(100))),
    );
    let (recorder, recording_events) =
        RecordingController::new(capture, RecordingOptions::default());
    let session = AssessmentSession::with_recorder(fx.api.clone(), recorder, recording_events);
    session.initialize("A1");

    let err = session.grant_permissions().await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    let state = session.state();
    assert_eq!(state.phase, Phase::Error);
    assert!(state.error.is_some());

    // Still denied after the error was dismissed
    session.clear_error();
    assert_eq!(session.state().phase, Phase::Idle);
    assert!(session.grant_permissions().await.is_err());

    devices.set_outcome(PermissionOutcome::Grant);
    session.retry().await?;

    let state = session.state();
    assert_eq!(state.phase, Phase::Ready);
    assert_eq!(state.assignment_id.as_deref(), Some("A1"));
    assert!(state.error.is_none());
    assert_eq!(
        session.recorder().unwrap().state().await,
        RecordingState::Ready
    );
    Ok(())
}

#[tokio::test]
async fn test_retry_after_failed_start_requests_orientation_again() -> Result<()> {
    let fx = fixture(TOKEN).await?;
    fx.backend.truncate_starts.store(1, Ordering::SeqCst);
    let session = AssessmentSession::new(fx.api.clone());
    session.initialize("A1");
    session.grant_permissions().await?;

    let err = session.start().await.unwrap_err();
    assert_eq!(err, Error::StreamIncomplete);
    assert_eq!(session.state().phase, Phase::Error);

    session.retry().await?;

    let state = session.state();
    assert_eq!(state.phase, Phase::InProgress);
    assert_eq!(state.attempt_id.as_deref(), Some("T1"));
    assert_eq!(
        turns(&session),
        vec![(Speaker::Interviewer, "Welcome. Let's begin.".to_string(), false)]
    );
    assert_eq!(fx.backend.started.lock().unwrap().len(), 2);
    Ok(())
}
