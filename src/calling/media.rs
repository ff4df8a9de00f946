//! Local media capture.
//!
//! A `LocalStream` is a cheap, cloneable handle: clones share the same
//! per-track enabled/live flags, so muting through one handle is seen by the
//! media pump holding another.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::CallError;
use crate::models::CallKind;

/// Kind of a single media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One captured track.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    fn new(kind: TrackKind) -> Self {
        let prefix = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        Self {
            id: format!("{}-{}", prefix, uuid::Uuid::new_v4()),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// A disabled track keeps flowing but carries silence / no frames.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// False once the track has been stopped.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }
}

/// Handle to the captured local media of one session.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    /// Audio track always, plus video for video calls.
    pub fn new(kind: CallKind) -> Self {
        let mut tracks = vec![LocalTrack::new(TrackKind::Audio)];
        if kind.has_video() {
            tracks.push(LocalTrack::new(TrackKind::Video));
        }
        Self {
            id: format!("stream-{}", uuid::Uuid::new_v4()),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn has_track(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    /// Toggle every track of `kind` in place. Returns false if there is none.
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let mut found = false;
        for track in self.tracks.iter().filter(|t| t.kind == kind) {
            track.enabled.store(enabled, Ordering::Relaxed);
            found = true;
        }
        found
    }

    pub fn is_track_enabled(&self, kind: TrackKind) -> bool {
        self.tracks
            .iter()
            .any(|t| t.kind == kind && t.is_enabled())
    }

    /// Stop all tracks. Stopped tracks never come back.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.live.store(false, Ordering::Relaxed);
        }
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }
}

/// Source of local camera/microphone media.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire the tracks a call of `kind` needs.
    async fn acquire(&self, kind: CallKind) -> Result<LocalStream, CallError>;

    /// Stop every track of a stream returned by `acquire`.
    fn release(&self, stream: &LocalStream) {
        stream.stop();
    }
}

/// Capture backed by a generated tone for audio.
///
/// Video calls require the configured capture device to be present and
/// readable, so permission and missing-device failures behave like real
/// capture would.
#[derive(Debug, Clone, Default)]
pub struct SyntheticCapture {
    video_device: Option<PathBuf>,
}

impl SyntheticCapture {
    pub fn new(video_device: Option<PathBuf>) -> Self {
        Self { video_device }
    }

    async fn probe_video_device(&self) -> Result<(), CallError> {
        let Some(ref path) = self.video_device else {
            return Ok(());
        };
        match tokio::fs::OpenOptions::new().read(true).open(path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                tracing::warn!("Camera {} is not accessible: {}", path.display(), e);
                Err(CallError::MediaAccessDenied)
            }
            Err(e) => {
                tracing::warn!("Camera {} unavailable: {}", path.display(), e);
                Err(CallError::MediaDeviceNotFound(path.display().to_string()))
            }
        }
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn acquire(&self, kind: CallKind) -> Result<LocalStream, CallError> {
        if kind.has_video() {
            self.probe_video_device().await?;
        }
        let stream = LocalStream::new(kind);
        tracing::info!(
            "Local media acquired: {} ({} tracks)",
            stream.id(),
            stream.tracks().len()
        );
        Ok(stream)
    }

    fn release(&self, stream: &LocalStream) {
        stream.stop();
        tracing::info!("Local media released: {}", stream.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_tracks_follow_call_kind() {
        let voice = LocalStream::new(CallKind::Voice);
        assert!(voice.has_track(TrackKind::Audio));
        assert!(!voice.has_track(TrackKind::Video));

        let video = LocalStream::new(CallKind::Video);
        assert_eq!(video.tracks().len(), 2);
    }

    #[test]
    fn test_toggle_is_shared_between_clones() {
        let stream = LocalStream::new(CallKind::Video);
        let clone = stream.clone();

        assert!(stream.set_track_enabled(TrackKind::Audio, false));
        assert!(!clone.is_track_enabled(TrackKind::Audio));
        assert!(clone.is_track_enabled(TrackKind::Video));

        let voice = LocalStream::new(CallKind::Voice);
        assert!(!voice.set_track_enabled(TrackKind::Video, false));
    }

    #[test]
    fn test_stop_marks_all_tracks_dead() {
        let stream = LocalStream::new(CallKind::Video);
        let clone = stream.clone();
        stream.stop();
        assert!(!clone.is_live());
        assert!(clone.tracks().iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn test_missing_camera_is_device_not_found() {
        let capture = SyntheticCapture::new(Some(PathBuf::from("/nonexistent/video9")));
        let err = capture.acquire(CallKind::Video).await.unwrap_err();
        assert!(matches!(err, CallError::MediaDeviceNotFound(_)));

        // Voice calls never touch the camera.
        assert!(capture.acquire(CallKind::Voice).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_stops_stream() {
        let capture = SyntheticCapture::default();
        let stream = capture.acquire(CallKind::Voice).await.unwrap();
        capture.release(&stream);
        assert!(!stream.is_live());
    }
}
