//! Room connector abstraction.
//!
//! A room is a shared real-time session through which participants exchange
//! named audio/video tracks. Transport vendors implement [`RoomConnector`]
//! and [`Room`]; wisp owns the lifecycle rules: publications are scoped
//! acquisitions whose guards unpublish on every exit path, including
//! cancellation.

use crate::error::{AgentError, Result};
use crate::pipeline::messages::{AudioFrame, VideoFrame};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Participant identity used to attribute published media.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantIdentity(pub String);

impl ParticipantIdentity {
    /// Create an identity from any string-like value.
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }
}

impl fmt::Display for ParticipantIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a room held by the external signaling layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomRef(pub String);

impl fmt::Display for RoomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options for publishing one track.
#[derive(Debug, Clone)]
pub struct TrackOptions {
    /// Track name within the participant's stream.
    pub name: String,
    /// Identity the track is attributed to.
    pub participant: ParticipantIdentity,
}

/// Guard that runs the unpublish hook when the publication is dropped.
///
/// `Drop` fires on normal return, on `?`, and on task cancellation, which
/// is what makes publications scoped acquisitions.
struct UnpublishGuard {
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for UnpublishGuard {
    fn drop(&mut self) {
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
    }
}

/// A published audio track, unpublished on drop.
pub struct AudioTrackPublication {
    options: TrackOptions,
    frame_tx: mpsc::Sender<AudioFrame>,
    _guard: UnpublishGuard,
}

impl AudioTrackPublication {
    /// Wrap an implementation-provided frame sink and unpublish hook.
    pub fn new(
        options: TrackOptions,
        frame_tx: mpsc::Sender<AudioFrame>,
        on_unpublish: Box<dyn FnOnce() + Send + Sync>,
    ) -> Self {
        Self {
            options,
            frame_tx,
            _guard: UnpublishGuard {
                on_drop: Some(on_unpublish),
            },
        }
    }

    /// Options the track was published with.
    pub fn options(&self) -> &TrackOptions {
        &self.options
    }

    /// Send one frame to the room.
    ///
    /// # Errors
    ///
    /// Returns a room error if the transport side has gone away.
    pub async fn send(&self, frame: AudioFrame) -> Result<()> {
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| AgentError::Room("audio track closed".to_owned()))
    }
}

/// A published video track, unpublished on drop.
pub struct VideoTrackPublication {
    options: TrackOptions,
    frame_tx: mpsc::Sender<VideoFrame>,
    _guard: UnpublishGuard,
}

impl VideoTrackPublication {
    /// Wrap an implementation-provided frame sink and unpublish hook.
    pub fn new(
        options: TrackOptions,
        frame_tx: mpsc::Sender<VideoFrame>,
        on_unpublish: Box<dyn FnOnce() + Send + Sync>,
    ) -> Self {
        Self {
            options,
            frame_tx,
            _guard: UnpublishGuard {
                on_drop: Some(on_unpublish),
            },
        }
    }

    /// Options the track was published with.
    pub fn options(&self) -> &TrackOptions {
        &self.options
    }

    /// Send one frame to the room.
    ///
    /// # Errors
    ///
    /// Returns a room error if the transport side has gone away.
    pub async fn send(&self, frame: VideoFrame) -> Result<()> {
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| AgentError::Room("video track closed".to_owned()))
    }
}

/// One connected room session.
#[async_trait]
pub trait Room: Send + Sync {
    /// Identity this job publishes under by default.
    fn local_identity(&self) -> ParticipantIdentity;

    /// Publish an audio track; the returned guard unpublishes on drop.
    ///
    /// # Errors
    ///
    /// Returns a room error if the track cannot be created.
    async fn publish_audio_track(&self, options: TrackOptions) -> Result<AudioTrackPublication>;

    /// Publish a video track; the returned guard unpublishes on drop.
    ///
    /// # Errors
    ///
    /// Returns a room error if the track cannot be created.
    async fn publish_video_track(&self, options: TrackOptions) -> Result<VideoTrackPublication>;

    /// Subscribe to remote participants' audio, mixed into one stream.
    ///
    /// # Errors
    ///
    /// Returns a room error if the subscription cannot be created.
    async fn subscribe_audio(&self) -> Result<mpsc::Receiver<AudioFrame>>;

    /// Attach presence metadata to the local participant, readable by the
    /// other room participants.
    ///
    /// # Errors
    ///
    /// Returns a room error if the metadata cannot be applied.
    async fn set_local_attributes(&self, attributes: HashMap<String, String>) -> Result<()>;

    /// Leave the room.
    ///
    /// # Errors
    ///
    /// Returns a room error if teardown fails; callers usually ignore it.
    async fn disconnect(&self) -> Result<()>;
}

/// Transport factory: performs handshake and auth for one room.
#[async_trait]
pub trait RoomConnector: Send + Sync {
    /// Connect to `room` as `identity`.
    ///
    /// Fails with a connection error on timeout or rejected auth; retrying
    /// is the caller's responsibility.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Connection`] on handshake failure.
    async fn connect(
        &self,
        room: &RoomRef,
        identity: &ParticipantIdentity,
        timeout: Duration,
    ) -> Result<Arc<dyn Room>>;
}
