//! Contract consumed from the external capture/filter pipeline.
//!
//! The pipeline delivers a processed output stream whose visual frames
//! already reflect the selected privacy mode, so raw frames never leave the
//! local machine. The core owns exactly two things at this boundary: the
//! audio track's enabled flag (mute) and the track lifecycle on teardown.

use crate::types::PrivacyMode;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("no capture hardware available")]
    Unavailable,
    #[error("capture hardware busy or timed out")]
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Handle to one live capture track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    pub kind: TrackKind,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Release the underlying capture device. Irreversible.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Processed output stream handed to the transport.
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    pub audio: Option<MediaTrack>,
    pub video: Option<MediaTrack>,
}

impl MediaStream {
    pub fn audio_only() -> Self {
        Self {
            audio: Some(MediaTrack::new(TrackKind::Audio)),
            video: None,
        }
    }

    pub fn audio_video() -> Self {
        Self {
            audio: Some(MediaTrack::new(TrackKind::Audio)),
            video: Some(MediaTrack::new(TrackKind::Video)),
        }
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    /// Mute gate: the core toggles the audio track directly.
    pub fn set_audio_enabled(&self, enabled: bool) {
        if let Some(audio) = &self.audio {
            audio.set_enabled(enabled);
        }
    }

    /// Stop every track. Called by the resource governor on cleanup.
    pub fn stop_all(&self) {
        if let Some(audio) = &self.audio {
            audio.stop();
        }
        if let Some(video) = &self.video {
            video.stop();
        }
    }
}

/// The external capture/filter pipeline the core consumes.
#[async_trait]
pub trait MediaPipeline: Send + Sync {
    /// Acquire a processed stream. With `video` false, an audio-only stream
    /// is requested. A pipeline without video hardware MAY return an
    /// audio-only stream even when video was requested.
    async fn acquire(&self, mode: PrivacyMode, video: bool) -> Result<MediaStream, MediaError>;

    /// Re-filter outbound frames for a new privacy mode.
    async fn set_privacy_mode(&self, mode: PrivacyMode) -> Result<(), MediaError>;
}

/// Acquire with the one-shot audio-only fallback: busy or timing-out
/// hardware gets a single retry without video; denial and absence do not.
pub async fn acquire_with_fallback(
    pipeline: &dyn MediaPipeline,
    mode: PrivacyMode,
) -> Result<MediaStream, MediaError> {
    match pipeline.acquire(mode, true).await {
        Ok(stream) => Ok(stream),
        Err(MediaError::Busy) => {
            warn!("capture busy, retrying audio-only");
            pipeline.acquire(mode, false).await
        }
        Err(err) => Err(err),
    }
}

/// Stand-in pipeline for tests and the demo binary: hands out synthetic
/// track handles and records the requested privacy mode.
pub struct SyntheticPipeline {
    has_video: bool,
    deny: bool,
    video_busy: bool,
    mode: std::sync::Mutex<PrivacyMode>,
}

impl SyntheticPipeline {
    pub fn new() -> Self {
        Self {
            has_video: true,
            deny: false,
            video_busy: false,
            mode: std::sync::Mutex::new(PrivacyMode::None),
        }
    }

    pub fn without_video() -> Self {
        Self {
            has_video: false,
            ..Self::new()
        }
    }

    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::new()
        }
    }

    /// Video acquisition reports busy; audio-only still succeeds.
    pub fn video_busy() -> Self {
        Self {
            video_busy: true,
            ..Self::new()
        }
    }

    pub fn current_mode(&self) -> PrivacyMode {
        *self.mode.lock().unwrap()
    }
}

impl Default for SyntheticPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaPipeline for SyntheticPipeline {
    async fn acquire(&self, mode: PrivacyMode, video: bool) -> Result<MediaStream, MediaError> {
        if self.deny {
            return Err(MediaError::PermissionDenied);
        }
        *self.mode.lock().unwrap() = mode;
        if video && self.video_busy {
            return Err(MediaError::Busy);
        }
        if video && self.has_video {
            Ok(MediaStream::audio_video())
        } else {
            Ok(MediaStream::audio_only())
        }
    }

    async fn set_privacy_mode(&self, mode: PrivacyMode) -> Result<(), MediaError> {
        *self.mode.lock().unwrap() = mode;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn busy_video_falls_back_to_audio_once() {
        let pipeline = SyntheticPipeline::video_busy();
        let stream = acquire_with_fallback(&pipeline, PrivacyMode::Blur)
            .await
            .unwrap();
        assert!(stream.audio.is_some());
        assert!(!stream.has_video());
    }

    #[tokio::test]
    async fn denial_does_not_fall_back() {
        let pipeline = SyntheticPipeline::denied();
        assert!(matches!(
            acquire_with_fallback(&pipeline, PrivacyMode::None).await,
            Err(MediaError::PermissionDenied)
        ));
    }

    #[test]
    fn mute_gate_toggles_audio_track() {
        let stream = MediaStream::audio_video();
        stream.set_audio_enabled(false);
        assert!(!stream.audio.as_ref().unwrap().is_enabled());
        stream.set_audio_enabled(true);
        assert!(stream.audio.as_ref().unwrap().is_enabled());
    }

    #[test]
    fn stop_all_is_terminal() {
        let stream = MediaStream::audio_video();
        stream.stop_all();
        assert!(stream.audio.as_ref().unwrap().is_stopped());
        assert!(stream.video.as_ref().unwrap().is_stopped());
    }
}
