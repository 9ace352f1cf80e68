// Deterministic capture backend
//
// Produces test-pattern tracks and an encoder that emits one chunk per
// timeslice of unpaused time. Used by the headless CLI and by tests, where
// tokio's paused clock makes chunk production fully reproducible.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use super::backend::{
    EncodedChunk, MediaConstraints, MediaDevices, MediaEncoder, MediaStream, MediaTrack, TrackKind,
};
use crate::error::{Error, Result};

/// How the synthetic devices answer a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Grant,
    Deny,
    NoDevice,
}

/// Test-pattern camera and microphone
pub struct SyntheticDevices {
    outcome: Mutex<PermissionOutcome>,
    acquisitions: AtomicUsize,
}

impl SyntheticDevices {
    pub fn new(outcome: PermissionOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            acquisitions: AtomicUsize::new(0),
        }
    }

    pub fn granting() -> Self {
        Self::new(PermissionOutcome::Grant)
    }

    /// Answer later requests differently (the user changed the site permission)
    pub fn set_outcome(&self, outcome: PermissionOutcome) {
        match self.outcome.lock() {
            Ok(mut guard) => *guard = outcome,
            Err(poisoned) => *poisoned.into_inner() = outcome,
        }
    }

    fn outcome(&self) -> PermissionOutcome {
        match self.outcome.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Number of successful acquisitions so far
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream> {
        match self.outcome() {
            PermissionOutcome::Deny => {
                return Err(Error::PermissionDenied("user dismissed the prompt".into()))
            }
            PermissionOutcome::NoDevice => {
                return Err(Error::DeviceUnavailable("no capture device attached".into()))
            }
            PermissionOutcome::Grant => {}
        }

        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(MediaTrack::new(format!("synthetic-video-{}", n), TrackKind::Video));
        }
        if constraints.audio {
            tracks.push(MediaTrack::new(format!("synthetic-audio-{}", n), TrackKind::Audio));
        }

        debug!("Synthetic devices granted {} tracks", tracks.len());
        Ok(MediaStream::new(tracks))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncoderState {
    Recording,
    Paused,
    Stopped,
}

/// Test-pattern encoder
pub struct SyntheticEncoder {
    timeslice: Duration,
    fault_after: Option<u64>,
    state_tx: Option<watch::Sender<EncoderState>>,
    encoded_tracks: Arc<Mutex<Vec<String>>>,
}

impl SyntheticEncoder {
    pub fn new(timeslice: Duration) -> Self {
        Self {
            timeslice,
            fault_after: None,
            state_tx: None,
            encoded_tracks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Emit a fault instead of the chunk with this ordinal
    pub fn with_fault_after(mut self, chunks: u64) -> Self {
        self.fault_after = Some(chunks);
        self
    }

    /// Shared view of the track ids fed to the encoder by the last `start`
    pub fn encoded_tracks(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.encoded_tracks)
    }

    /// Bytes of the chunk with the given ordinal
    pub fn chunk_payload(ordinal: u64) -> Vec<u8> {
        format!("chunk-{:04};", ordinal).into_bytes()
    }

    fn set_state(&self, state: EncoderState) {
        if let Some(tx) = &self.state_tx {
            tx.send_replace(state);
        }
    }
}

impl MediaEncoder for SyntheticEncoder {
    fn start(&mut self, stream: &MediaStream) -> Result<mpsc::Receiver<EncodedChunk>> {
        if !stream.is_live() {
            return Err(Error::RecorderFault("stream has no live tracks".into()));
        }
        if self.timeslice.is_zero() {
            return Err(Error::RecorderFault("timeslice must be non-zero".into()));
        }

        if let Ok(mut ids) = self.encoded_tracks.lock() {
            *ids = stream.tracks.iter().map(|t| t.id.clone()).collect();
        }

        let (tx, rx) = mpsc::channel(64);
        let (state_tx, mut state_rx) = watch::channel(EncoderState::Recording);
        self.state_tx = Some(state_tx);

        let timeslice = self.timeslice;
        let fault_after = self.fault_after;

        info!("Synthetic encoder started ({}ms timeslice)", timeslice.as_millis());

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + timeslice, timeslice);
            let mut ordinal: u64 = 0;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *state_rx.borrow() != EncoderState::Recording {
                            continue;
                        }
                        if fault_after == Some(ordinal) {
                            warn!("Synthetic encoder injecting fault at chunk {}", ordinal);
                            let _ = tx.send(Err(Error::RecorderFault("encoder crashed".into()))).await;
                            break;
                        }
                        if tx.send(Ok(Self::chunk_payload(ordinal))).await.is_err() {
                            break;
                        }
                        ordinal += 1;
                    }
                    changed = state_rx.changed() => {
                        if changed.is_err() || *state_rx.borrow() == EncoderState::Stopped {
                            break;
                        }
                    }
                }
            }

            debug!("Synthetic encoder finished after {} chunks", ordinal);
        });

        Ok(rx)
    }

    fn pause(&mut self) {
        self.set_state(EncoderState::Paused);
    }

    fn resume(&mut self) {
        self.set_state(EncoderState::Recording);
    }

    fn stop(&mut self) {
        self.set_state(EncoderState::Stopped);
        self.state_tx = None;
    }

    fn mime_type(&self) -> &str {
        "video/webm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denied_permission_is_reported() {
        let devices = SyntheticDevices::new(PermissionOutcome::Deny);
        let err = devices
            .get_user_media(MediaConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        assert_eq!(devices.acquisitions(), 0);

        devices.set_outcome(PermissionOutcome::Grant);
        assert!(devices.get_user_media(MediaConstraints::default()).await.is_ok());
        assert_eq!(devices.acquisitions(), 1);
    }

    #[tokio::test]
    async fn constraints_select_tracks() {
        let devices = SyntheticDevices::granting();
        let stream = devices
            .get_user_media(MediaConstraints {
                video: false,
                audio: true,
            })
            .await
            .unwrap();
        assert_eq!(stream.audio_tracks().count(), 1);
        assert_eq!(stream.video_tracks().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_encoder_emits_nothing() {
        let stream = MediaStream::new(vec![MediaTrack::new("mic", TrackKind::Audio)]);
        let mut encoder = SyntheticEncoder::new(Duration::from_millis(100));
        let mut rx = encoder.start(&stream).unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        encoder.pause();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        encoder.stop();

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk.unwrap());
        }
        assert_eq!(
            chunks,
            vec![
                SyntheticEncoder::chunk_payload(0),
                SyntheticEncoder::chunk_payload(1)
            ]
        );
    }
}
