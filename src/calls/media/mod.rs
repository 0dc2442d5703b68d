//! Local and remote media for a call.
//!
//! # Architecture
//!
//! - [`MediaDevices`]: platform capture capability, opens tracks for a call kind
//! - [`MediaTrack`]: one audio or video track handle with an `enabled` flag
//! - [`MediaController`]: owns every track of the active session and
//!   guarantees they are stopped on every exit path
//!
//! Mute and camera toggles flip `enabled` flags only. They never touch the
//! peer connection, so toggling never renegotiates.

#[cfg(feature = "webrtc")]
pub mod webrtc;

use async_trait::async_trait;
use callcore::{CallKind, TrackKind};
use log::{debug, info};
use std::sync::Arc;

use super::error::MediaError;

/// A single audio or video track.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    /// Stop the track and free its device. Must tolerate repeated calls.
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

/// Media capture capability of the host platform.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open one track per kind in `kind.track_kinds()`.
    async fn open(&self, kind: CallKind) -> Result<Vec<Arc<dyn MediaTrack>>, MediaError>;
}

/// Owns the tracks of one call session.
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    local: Vec<Arc<dyn MediaTrack>>,
    remote: Vec<Arc<dyn MediaTrack>>,
    muted: bool,
    video_enabled: bool,
    acquisitions: usize,
}

impl MediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            local: Vec::new(),
            remote: Vec::new(),
            muted: false,
            video_enabled: true,
            acquisitions: 0,
        }
    }

    /// Open local tracks for `kind`. A second call returns the tracks
    /// already held.
    pub async fn acquire(
        &mut self,
        kind: CallKind,
    ) -> Result<Vec<Arc<dyn MediaTrack>>, MediaError> {
        if !self.local.is_empty() {
            return Ok(self.local.clone());
        }
        self.acquisitions += 1;
        let tracks = self.devices.open(kind).await?;
        for track in &tracks {
            self.apply_preferences(track.as_ref());
        }
        info!(
            target: "Call/Media",
            "Acquired {} local track(s) for {kind} call",
            tracks.len()
        );
        self.local = tracks;
        Ok(self.local.clone())
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        for track in self.local.iter().filter(|t| t.kind() == TrackKind::Audio) {
            track.set_enabled(!muted);
        }
        debug!(target: "Call/Media", "Audio muted: {muted}");
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        for track in self.local.iter().filter(|t| t.kind() == TrackKind::Video) {
            track.set_enabled(enabled);
        }
        debug!(target: "Call/Media", "Video enabled: {enabled}");
    }

    pub fn add_remote_track(&mut self, track: Arc<dyn MediaTrack>) {
        debug!(
            target: "Call/Media",
            "Remote {} track {} arrived",
            track.kind(),
            track.id()
        );
        self.remote.push(track);
    }

    /// Stop and drop every local and remote track. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.local.is_empty() && self.remote.is_empty() {
            return;
        }
        let count = self.local.len() + self.remote.len();
        for track in self.local.drain(..).chain(self.remote.drain(..)) {
            track.stop();
        }
        info!(target: "Call/Media", "Released {count} track(s)");
    }

    pub fn local_tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.local
    }

    pub fn remote_tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.remote
    }

    /// Tracks still held and not stopped.
    pub fn active_track_count(&self) -> usize {
        self.local
            .iter()
            .chain(self.remote.iter())
            .filter(|t| !t.is_stopped())
            .count()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled
    }

    /// How many times capture was actually opened.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions
    }

    fn apply_preferences(&self, track: &dyn MediaTrack) {
        match track.kind() {
            TrackKind::Audio => track.set_enabled(!self.muted),
            TrackKind::Video => track.set_enabled(self.video_enabled),
        }
    }
}

impl Drop for MediaController {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::loopback::{LoopbackMedia, LoopbackTrack};

    #[tokio::test]
    async fn test_acquire_applies_earlier_preferences() {
        let devices = LoopbackMedia::new();
        let mut media = MediaController::new(Arc::new(devices.clone()));
        media.set_muted(true);
        media.set_video_enabled(false);

        let tracks = media.acquire(CallKind::Video).await.unwrap();
        assert_eq!(tracks.len(), 2);
        for track in &tracks {
            assert!(!track.is_enabled(), "{} should start disabled", track.kind());
        }
    }

    #[tokio::test]
    async fn test_acquire_twice_opens_once() {
        let devices = LoopbackMedia::new();
        let mut media = MediaController::new(Arc::new(devices.clone()));
        media.acquire(CallKind::Audio).await.unwrap();
        media.acquire(CallKind::Audio).await.unwrap();
        assert_eq!(media.acquisitions(), 1);
        assert_eq!(devices.probe().opened(), 1);
    }

    #[tokio::test]
    async fn test_toggles_only_touch_matching_kind() {
        let devices = LoopbackMedia::new();
        let mut media = MediaController::new(Arc::new(devices));
        media.acquire(CallKind::Video).await.unwrap();
        let audio = media.local_tracks()[0].clone();
        let video = media.local_tracks()[1].clone();

        media.set_muted(true);
        assert_eq!(audio.kind(), TrackKind::Audio);
        assert!(!audio.is_enabled());
        assert!(video.is_enabled());

        media.set_video_enabled(false);
        assert!(!video.is_enabled());
        media.set_muted(false);
        assert!(audio.is_enabled());
    }

    #[tokio::test]
    async fn test_release_stops_local_and_remote() {
        let devices = LoopbackMedia::new();
        let mut media = MediaController::new(Arc::new(devices.clone()));
        media.acquire(CallKind::Audio).await.unwrap();
        let remote = Arc::new(LoopbackTrack::new("remote-audio", TrackKind::Audio));
        media.add_remote_track(remote.clone());
        assert_eq!(media.active_track_count(), 2);

        media.release();
        assert_eq!(media.active_track_count(), 0);
        assert!(remote.is_stopped());
        assert_eq!(devices.probe().live_tracks(), 0);

        // Second release is a no-op.
        media.release();
        assert!(media.local_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_failure_is_typed() {
        let devices = LoopbackMedia::new();
        devices.fail_next_open(MediaError::PermissionDenied("camera".into()));
        let mut media = MediaController::new(Arc::new(devices));
        let err = media.acquire(CallKind::Video).await.err().expect("acquire should fail");
        assert_eq!(err, MediaError::PermissionDenied("camera".into()));
        assert_eq!(media.active_track_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_tracks() {
        let devices = LoopbackMedia::new();
        {
            let mut media = MediaController::new(Arc::new(devices.clone()));
            media.acquire(CallKind::Video).await.unwrap();
            assert_eq!(devices.probe().live_tracks(), 2);
        }
        assert_eq!(devices.probe().live_tracks(), 0);
    }
}
