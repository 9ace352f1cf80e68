//! Streaming response consumption
//!
//! Turns an HTTP body arriving in arbitrary pieces into typed events:
//! - `sse`: record framing with verbatim remainder carry-over
//! - `events`: per-event payload decoding
//! - `consumer`: read loop, terminal-event accounting and cancellation

pub mod consumer;
pub mod events;
pub mod sse;

pub use consumer::{
    consume_event_source, consume_stream, CancelToken, StreamOutcome, StreamSlot, StreamTicket,
};
pub use events::{DonePayload, StreamEvent};
pub use sse::{parse_buffer, SseFrame, SseParser};
