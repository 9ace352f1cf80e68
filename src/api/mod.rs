//! Assessment backend API
//!
//! - POST /api/assessments/:assignment_id/start - Start an attempt (SSE reply)
//! - POST /api/assessments/:attempt_id/message - Send a learner message (SSE reply)
//! - GET /api/assessments/:attempt_id/stream - Long-lived event stream
//! - POST /api/assessments/:attempt_id/video - Final recording upload
//! - POST /api/assessments/:attempt_id/video/chunks - Progressive chunk upload
//! - POST /api/assessments/:attempt_id/complete - Mark the attempt complete

mod auth;
mod client;

pub use auth::TokenStore;
pub use client::{ApiClient, EventBody};
