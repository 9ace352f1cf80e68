use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{Blob, MediaConstraints, MediaDevices, MediaEncoder, MediaStream};
use crate::error::{Error, Result};

/// Encoder activity as seen by the capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Inactive,
    Recording,
    Paused,
}

/// Owns the camera/microphone tracks and the chunked encoder running over them
///
/// The raw stream stays available for preview; the encoder may be fed a
/// different audio source (e.g. synthesized speech) without it reaching the
/// preview.
pub struct MediaCaptureSession {
    devices: Arc<dyn MediaDevices>,
    encoder: Box<dyn MediaEncoder>,
    stream: Option<MediaStream>,
    state: CaptureState,
    chunks: Arc<Mutex<Vec<Vec<u8>>>>,
    drain_task: Option<JoinHandle<()>>,
    error_rx: Option<mpsc::UnboundedReceiver<Error>>,
}

impl MediaCaptureSession {
    pub fn new(devices: Arc<dyn MediaDevices>, encoder: Box<dyn MediaEncoder>) -> Self {
        Self {
            devices,
            encoder,
            stream: None,
            state: CaptureState::Inactive,
            chunks: Arc::new(Mutex::new(Vec::new())),
            drain_task: None,
            error_rx: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Raw stream for live preview
    pub fn preview_stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    /// Request device access
    ///
    /// The returned stream shares its tracks with the session, which keeps
    /// authority to stop them.
    pub async fn acquire(&mut self, constraints: MediaConstraints) -> Result<MediaStream> {
        if !constraints.video && !constraints.audio {
            return Err(Error::DeviceUnavailable("no device requested".into()));
        }

        info!(
            "Requesting media from {} (video={}, audio={})",
            self.devices.name(),
            constraints.video,
            constraints.audio
        );

        let stream = self.devices.get_user_media(constraints).await?;

        if let Some(previous) = self.stream.replace(stream.clone()) {
            warn!("Replacing previously acquired stream");
            previous.stop_all();
        }

        Ok(stream)
    }

    /// Start producing chunks from `stream`
    ///
    /// With `audio_override`, the encoder records the override's audio tracks
    /// instead of the stream's own.
    pub fn start_encoding(
        &mut self,
        stream: &MediaStream,
        audio_override: Option<&MediaStream>,
    ) -> Result<()> {
        if self.state != CaptureState::Inactive {
            return Err(Error::InvalidState("encoder already running".into()));
        }

        let recording_stream = match audio_override {
            Some(audio) => stream.with_audio_from(audio),
            None => stream.clone(),
        };

        let mut chunk_rx = self.encoder.start(&recording_stream)?;
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        self.error_rx = Some(error_rx);

        let chunks = Arc::clone(&self.chunks);
        self.drain_task = Some(tokio::spawn(async move {
            while let Some(item) = chunk_rx.recv().await {
                match item {
                    Ok(chunk) => {
                        let mut chunks = match chunks.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        debug!("Encoded chunk {} ({} bytes)", chunks.len(), chunk.len());
                        chunks.push(chunk);
                    }
                    Err(e) => {
                        error!("Encoder fault: {}", e);
                        let _ = error_tx.send(e);
                        break;
                    }
                }
            }
        }));

        self.state = CaptureState::Recording;
        info!(
            "Encoding {} tracks ({})",
            recording_stream.tracks.len(),
            self.encoder.mime_type()
        );

        Ok(())
    }

    /// Receiver for faults raised by the current encoding run
    pub fn take_error_channel(&mut self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.error_rx.take()
    }

    /// Returns false if the encoder was not recording
    pub fn pause(&mut self) -> bool {
        if self.state != CaptureState::Recording {
            return false;
        }
        self.encoder.pause();
        self.state = CaptureState::Paused;
        true
    }

    /// Returns false if the encoder was not paused
    pub fn resume(&mut self) -> bool {
        if self.state != CaptureState::Paused {
            return false;
        }
        self.encoder.resume();
        self.state = CaptureState::Recording;
        true
    }

    /// Flush the encoder, join all chunks and release the hardware
    pub async fn stop(&mut self) -> Result<Blob> {
        if self.state == CaptureState::Inactive {
            return Err(Error::InvalidState("encoder is not running".into()));
        }

        self.encoder.stop();
        if let Some(task) = self.drain_task.take() {
            if let Err(e) = task.await {
                error!("Chunk drain task panicked: {}", e);
            }
        }
        self.state = CaptureState::Inactive;

        let blob = {
            let chunks = self.lock_chunks();
            Blob::concat(chunks.iter(), self.encoder.mime_type())
        };

        self.release_tracks();
        info!("Capture stopped: {} bytes", blob.len());

        Ok(blob)
    }

    /// Discard chunks and return to inactive. Tracks are left to the caller.
    pub fn reset(&mut self) {
        if self.state != CaptureState::Inactive {
            self.encoder.stop();
        }
        if let Some(task) = self.drain_task.take() {
            task.abort();
        }
        self.error_rx = None;
        self.lock_chunks().clear();
        self.state = CaptureState::Inactive;
    }

    /// Stop every acquired track
    pub fn release_tracks(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop_all();
            debug!("Released {} tracks", stream.tracks.len());
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.lock_chunks().len()
    }

    /// Copies of the chunks from `index` onwards
    pub fn chunks_from(&self, index: usize) -> Vec<Vec<u8>> {
        let chunks = self.lock_chunks();
        chunks.get(index..).map(<[_]>::to_vec).unwrap_or_default()
    }

    pub fn mime_type(&self) -> &str {
        self.encoder.mime_type()
    }

    fn lock_chunks(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        match self.chunks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for MediaCaptureSession {
    fn drop(&mut self) {
        if let Some(task) = self.drain_task.take() {
            task.abort();
        }
        if let Some(stream) = self.stream.take() {
            stream.stop_all();
        }
    }
}
