use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;

/// Kind of a captured media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Requested devices for capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

/// A single live track
///
/// Clones share the same hardware handle; stopping any clone stops the track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    live: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Release the underlying device. Idempotent.
    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// A set of tracks acquired together
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Video)
    }

    /// True while at least one track still holds its device
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Video from `self`, audio from `audio`
    pub fn with_audio_from(&self, audio: &MediaStream) -> MediaStream {
        let tracks = self
            .video_tracks()
            .chain(audio.audio_tracks())
            .cloned()
            .collect();
        MediaStream { tracks }
    }
}

/// Encoded recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl Blob {
    pub fn concat<'a>(chunks: impl IntoIterator<Item = &'a Vec<u8>>, mime_type: &str) -> Self {
        let data = chunks.into_iter().flatten().copied().collect();
        Self {
            data,
            mime_type: mime_type.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Item produced by an encoder: a chunk, or a fault that ends the recording
pub type EncodedChunk = Result<Vec<u8>>;

/// Device access
///
/// Implementations:
/// - Synthetic: deterministic test-pattern tracks (CLI and tests)
#[async_trait::async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request access to the devices named by `constraints`
    ///
    /// Fails with `PermissionDenied` or `DeviceUnavailable`
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream>;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Chunked encoder over a media stream
pub trait MediaEncoder: Send {
    /// Begin encoding `stream`
    ///
    /// Returns a channel receiver that yields encoded chunks in order. The channel
    /// closes once the encoder has been stopped and flushed.
    fn start(&mut self, stream: &MediaStream) -> Result<mpsc::Receiver<EncodedChunk>>;

    fn pause(&mut self);

    fn resume(&mut self);

    /// Flush pending data and close the chunk channel
    fn stop(&mut self);

    /// Container type of produced chunks
    fn mime_type(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopping_a_clone_stops_the_track() {
        let track = MediaTrack::new("mic", TrackKind::Audio);
        let clone = track.clone();
        clone.stop();
        assert!(!track.is_live());
    }

    #[test]
    fn audio_override_replaces_only_audio() {
        let camera = MediaStream::new(vec![
            MediaTrack::new("cam", TrackKind::Video),
            MediaTrack::new("mic", TrackKind::Audio),
        ]);
        let speech = MediaStream::new(vec![MediaTrack::new("tts", TrackKind::Audio)]);

        let mixed = camera.with_audio_from(&speech);
        let ids: Vec<_> = mixed.tracks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["cam", "tts"]);
    }

    #[test]
    fn blob_concatenates_in_order() {
        let chunks = vec![b"ab".to_vec(), b"cd".to_vec()];
        let blob = Blob::concat(&chunks, "video/webm");
        assert_eq!(blob.data, b"abcd");
        assert_eq!(blob.len(), 4);
    }
}
