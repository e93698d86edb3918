//! Avatar bridge: substitutes an external embodiment's lip-synced
//! audio/video for the raw synthesized voice.
//!
//! The bridge owns a duplex stream to the renderer. Outbound it forwards
//! synthesized audio and utterance boundaries; inbound it republishes the
//! rendered audio/video into the room under the avatar's own participant
//! identity. Utterance ordering is preserved by the single outbound loop,
//! and hand-off is suspended once a bounded number of utterances are
//! unacknowledged, so a lagging renderer cannot grow memory without bound.

pub mod ws;

use crate::config::{AvatarConfig, AvatarRef};
use crate::error::{AgentError, Result};
use crate::events::SessionEvent;
use crate::pipeline::messages::{AudioFrame, ControlEvent, SynthesizedAudio, VideoFrame};
use crate::room::{ParticipantIdentity, Room, TrackOptions};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Track names the avatar publishes under.
const AVATAR_AUDIO_TRACK: &str = "avatar-voice";
const AVATAR_VIDEO_TRACK: &str = "avatar-video";

/// Channel buffer sizes for the bridge.
const BRIDGE_OUTBOUND_CHANNEL_SIZE: usize = 16;

/// Handshake payload supplied to the renderer.
#[derive(Debug, Clone)]
pub struct AvatarHandshake {
    /// Which avatar to embody (registered id or image asset).
    pub avatar: AvatarRef,
    /// Display name for the avatar participant.
    pub display_name: String,
    /// Identity the rendered tracks are attributed to.
    pub participant_identity: ParticipantIdentity,
}

/// Data flowing from the bridge to the renderer.
#[derive(Debug, Clone)]
pub enum RendererInput {
    /// One synthesized audio frame.
    Audio(AudioFrame),
    /// The utterance currently streaming is complete.
    UtteranceEnd {
        /// Finished utterance.
        utterance_id: u64,
    },
}

/// Data flowing from the renderer back to the bridge.
#[derive(Debug, Clone)]
pub enum RendererOutput {
    /// Rendered (lip-synced) audio.
    Audio(AudioFrame),
    /// Rendered video.
    Video(VideoFrame),
    /// The renderer finished consuming an utterance.
    UtteranceAck {
        /// Acknowledged utterance.
        utterance_id: u64,
    },
    /// The renderer stream ended.
    Closed {
        /// Renderer-reported reason.
        reason: String,
    },
}

/// Live duplex stream to a renderer.
pub struct RendererSession {
    /// Synthesized audio and utterance boundaries, in order.
    pub input_tx: mpsc::Sender<RendererInput>,
    /// Rendered frames and acknowledgements, in order.
    pub output_rx: mpsc::Receiver<RendererOutput>,
}

/// External avatar renderer contract.
#[async_trait]
pub trait AvatarRenderer: Send + Sync {
    /// Perform the handshake and establish the duplex stream.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::AvatarUnavailable`] when the renderer rejects
    /// the handshake.
    async fn start(&self, handshake: AvatarHandshake) -> Result<RendererSession>;
}

/// Bridge handshake/stream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Handshake in progress.
    Pending,
    /// Rendered stream live.
    Active,
    /// Stream over (renderer failure or session end).
    Closed,
}

/// A running avatar bridge for one session.
pub struct AvatarBridge {
    outbound_tx: mpsc::Sender<SynthesizedAudio>,
    state_rx: watch::Receiver<BridgeState>,
}

impl AvatarBridge {
    /// Start the bridge: handshake, publish the avatar's tracks, and spawn
    /// the forwarding loops.
    ///
    /// Must run before the orchestrator produces any output so the first
    /// utterance already flows through the renderer.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::AvatarUnavailable`] when the handshake times
    /// out, is rejected, or the avatar's tracks cannot be published.
    pub async fn start(
        renderer: Arc<dyn AvatarRenderer>,
        config: &AvatarConfig,
        room: Arc<dyn Room>,
        control_tx: mpsc::UnboundedSender<ControlEvent>,
        events: Option<tokio::sync::broadcast::Sender<SessionEvent>>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(BridgeState::Pending);
        if let Some(events) = &events {
            let _ = events.send(SessionEvent::AvatarState {
                state: BridgeState::Pending,
            });
        }

        let identity = ParticipantIdentity::new(config.participant_identity.clone());
        let handshake = AvatarHandshake {
            avatar: config.avatar.clone(),
            display_name: config.display_name.clone(),
            participant_identity: identity.clone(),
        };

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let session = tokio::time::timeout(timeout, renderer.start(handshake))
            .await
            .map_err(|_| {
                AgentError::AvatarUnavailable("renderer handshake timed out".to_owned())
            })??;

        let audio_pub = room
            .publish_audio_track(TrackOptions {
                name: AVATAR_AUDIO_TRACK.to_owned(),
                participant: identity.clone(),
            })
            .await
            .map_err(|e| {
                AgentError::AvatarUnavailable(format!("failed to publish avatar audio: {e}"))
            })?;
        let video_pub = room
            .publish_video_track(TrackOptions {
                name: AVATAR_VIDEO_TRACK.to_owned(),
                participant: identity.clone(),
            })
            .await
            .map_err(|e| {
                AgentError::AvatarUnavailable(format!("failed to publish avatar video: {e}"))
            })?;

        info!(identity = %identity, "avatar bridge active");
        state_tx.send_replace(BridgeState::Active);
        if let Some(events) = &events {
            let _ = events.send(SessionEvent::AvatarState {
                state: BridgeState::Active,
            });
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(BRIDGE_OUTBOUND_CHANNEL_SIZE);
        let inflight = Arc::new(Semaphore::new(config.max_inflight_utterances));
        let permits: Arc<Mutex<HashMap<u64, OwnedSemaphorePermit>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Outbound: synthesized audio → renderer, gated by unacked count.
        {
            let inflight = Arc::clone(&inflight);
            let permits = Arc::clone(&permits);
            let input_tx = session.input_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_outbound(outbound_rx, input_tx, inflight, permits, cancel).await;
            });
        }

        // Inbound: rendered frames → room, acks release the gate. The
        // publications live in this task, so its exit unpublishes them.
        {
            let permits = Arc::clone(&permits);
            let state_tx = state_tx.clone();
            let cancel = cancel.clone();
            let events = events.clone();
            let output_rx = session.output_rx;
            tokio::spawn(async move {
                run_inbound(
                    output_rx, audio_pub, video_pub, permits, state_tx, control_tx, events, cancel,
                )
                .await;
            });
        }

        Ok(Self {
            outbound_tx,
            state_rx,
        })
    }

    /// Sink the output router hands synthesized audio to.
    pub fn sink(&self) -> mpsc::Sender<SynthesizedAudio> {
        self.outbound_tx.clone()
    }

    /// Current bridge state.
    pub fn state(&self) -> BridgeState {
        *self.state_rx.borrow()
    }
}

/// Forward synthesized audio to the renderer, acquiring one in-flight
/// permit per utterance. When the permit pool is exhausted this loop stops
/// receiving, the bounded channels upstream fill, and synthesis hand-off
/// suspends. That is the backpressure path.
async fn run_outbound(
    mut outbound_rx: mpsc::Receiver<SynthesizedAudio>,
    input_tx: mpsc::Sender<RendererInput>,
    inflight: Arc<Semaphore>,
    permits: Arc<Mutex<HashMap<u64, OwnedSemaphorePermit>>>,
    cancel: CancellationToken,
) {
    let mut current_utterance: Option<u64> = None;
    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => break,
            chunk = outbound_rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        if current_utterance != Some(chunk.utterance_id) {
            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = Arc::clone(&inflight).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            permits
                .lock()
                .expect("permit map poisoned")
                .insert(chunk.utterance_id, permit);
            current_utterance = Some(chunk.utterance_id);
        }

        if !chunk.frame.samples.is_empty()
            && input_tx
                .send(RendererInput::Audio(chunk.frame))
                .await
                .is_err()
        {
            break;
        }
        if chunk.is_final {
            current_utterance = None;
            if input_tx
                .send(RendererInput::UtteranceEnd {
                    utterance_id: chunk.utterance_id,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    }
}

/// Republish rendered frames into the room and release utterance permits
/// as acks arrive.
#[allow(clippy::too_many_arguments)]
async fn run_inbound(
    mut output_rx: mpsc::Receiver<RendererOutput>,
    audio_pub: crate::room::AudioTrackPublication,
    video_pub: crate::room::VideoTrackPublication,
    permits: Arc<Mutex<HashMap<u64, OwnedSemaphorePermit>>>,
    state_tx: watch::Sender<BridgeState>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    events: Option<tokio::sync::broadcast::Sender<SessionEvent>>,
    cancel: CancellationToken,
) {
    let close = |reason: String| {
        state_tx.send_replace(BridgeState::Closed);
        if let Some(events) = &events {
            let _ = events.send(SessionEvent::AvatarState {
                state: BridgeState::Closed,
            });
        }
        let _ = control_tx.send(ControlEvent::AvatarFailed { reason });
    };

    loop {
        let output = tokio::select! {
            () = cancel.cancelled() => {
                state_tx.send_replace(BridgeState::Closed);
                break;
            }
            output = output_rx.recv() => output,
        };
        match output {
            Some(RendererOutput::Audio(frame)) => {
                if audio_pub.send(frame).await.is_err() {
                    warn!("avatar audio track closed, dropping bridge");
                    close("room audio track closed".to_owned());
                    break;
                }
            }
            Some(RendererOutput::Video(frame)) => {
                if video_pub.send(frame).await.is_err() {
                    warn!("avatar video track closed, dropping bridge");
                    close("room video track closed".to_owned());
                    break;
                }
            }
            Some(RendererOutput::UtteranceAck { utterance_id }) => {
                // Dropping the permit reopens the outbound gate.
                permits
                    .lock()
                    .expect("permit map poisoned")
                    .remove(&utterance_id);
            }
            Some(RendererOutput::Closed { reason }) => {
                warn!(%reason, "avatar renderer stream closed");
                close(reason);
                break;
            }
            None => {
                warn!("avatar renderer stream ended");
                close("renderer stream ended".to_owned());
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Bridge behavior is exercised end-to-end in `tests/avatar_session.rs`
    // with scripted renderers; here only the state plumbing.

    #[test]
    fn bridge_state_is_copyable_and_comparable() {
        let s = BridgeState::Pending;
        assert_ne!(s, BridgeState::Active);
        assert!(matches!(s, BridgeState::Pending));
    }
}
