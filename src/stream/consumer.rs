use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{Stream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::events::{DonePayload, StreamEvent};
use super::sse::SseParser;
use crate::error::{Error, Result};

/// Cooperative cancellation for one in-flight stream
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle on the stream that currently owns a conversation
#[derive(Debug, Clone)]
pub struct StreamTicket {
    pub generation: u64,
    pub token: CancelToken,
}

/// At most one active stream per conversation
///
/// Beginning a stream cancels the previous one; updates from a stream are
/// applied only while its ticket is still current.
#[derive(Debug, Default)]
pub struct StreamSlot {
    current: Mutex<Option<StreamTicket>>,
    next_generation: AtomicU64,
}

impl StreamSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> StreamTicket {
        let ticket = StreamTicket {
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
            token: CancelToken::new(),
        };

        let mut current = self.lock();
        if let Some(previous) = current.replace(ticket.clone()) {
            debug!("Cancelling stream {} for {}", previous.generation, ticket.generation);
            previous.token.cancel();
        }

        ticket
    }

    pub fn is_current(&self, generation: u64) -> bool {
        matches!(&*self.lock(), Some(ticket) if ticket.generation == generation)
    }

    /// Release the slot if `generation` still holds it
    pub fn finish(&self, generation: u64) -> bool {
        let mut current = self.lock();
        if matches!(&*current, Some(ticket) if ticket.generation == generation) {
            *current = None;
            true
        } else {
            false
        }
    }

    /// Cancel whatever is running; returns whether a stream was live
    pub fn cancel(&self) -> bool {
        match self.lock().take() {
            Some(ticket) => {
                ticket.token.cancel();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<StreamTicket>> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// How a stream consumption ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed {
        done: Option<DonePayload>,
        tokens: usize,
    },
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    /// POST response: must see a terminal event before the body ends
    Response,
    /// Long-lived EventSource: ends when the server closes it
    EventSource,
}

/// Consume a POST-initiated response body
///
/// `on_event` sees every decoded event in arrival order. Malformed payloads
/// are logged and skipped. Ending without `done`/`message_done` is
/// `StreamIncomplete`; a server `error` event ends with `Error::Server`.
pub async fn consume_stream<S, B, E, F>(body: S, token: &CancelToken, on_event: F) -> Result<StreamOutcome>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
    F: FnMut(&StreamEvent),
{
    consume(body, token, Transport::Response, on_event).await
}

/// Consume a long-lived event stream until the server closes it
pub async fn consume_event_source<S, B, E, F>(body: S, token: &CancelToken, on_event: F) -> Result<StreamOutcome>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
    F: FnMut(&StreamEvent),
{
    consume(body, token, Transport::EventSource, on_event).await
}

async fn consume<S, B, E, F>(
    mut body: S,
    token: &CancelToken,
    transport: Transport,
    mut on_event: F,
) -> Result<StreamOutcome>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
    F: FnMut(&StreamEvent),
{
    let mut parser = SseParser::new();
    let mut terminal = false;
    let mut done = None;
    let mut tokens = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Stream cancelled after {} tokens", tokens);
                return Ok(StreamOutcome::Cancelled);
            }
            item = body.next() => item,
        };

        let Some(item) = next else {
            break;
        };
        let bytes = item.map_err(|e| Error::Network(e.to_string()))?;

        for frame in parser.feed(bytes.as_ref()) {
            if token.is_cancelled() {
                return Ok(StreamOutcome::Cancelled);
            }

            let event = match StreamEvent::decode(&frame) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Dropping event: {}", e);
                    continue;
                }
            };

            match &event {
                StreamEvent::Token { .. } => tokens += 1,
                StreamEvent::Done(payload) => done = Some(payload.clone()),
                StreamEvent::Error {
                    message,
                    recoverable,
                } => {
                    warn!("Server reported error: {}", message);
                    return Err(Error::Server {
                        message: message.clone(),
                        recoverable: *recoverable,
                    });
                }
                StreamEvent::Unknown { name } => {
                    debug!("Ignoring unknown event `{}`", name);
                    continue;
                }
                StreamEvent::MessageDone | StreamEvent::AssessmentComplete { .. } => {}
            }

            if event.is_terminal() {
                terminal = true;
            }
            on_event(&event);
        }
    }

    if !parser.remainder().trim().is_empty() {
        debug!("Discarding partial record at end of body: {:?}", parser.remainder());
    }

    match transport {
        Transport::Response if !terminal => {
            warn!("Stream ended after {} tokens without a terminal event", tokens);
            Err(Error::StreamIncomplete)
        }
        _ => {
            info!("Stream complete: {} tokens", tokens);
            Ok(StreamOutcome::Completed { done, tokens })
        }
    }
}
