//! WebSocket renderer transport.
//!
//! Reference implementation of [`AvatarRenderer`] over a WebSocket duplex.
//! The framing here is wisp's own; vendor-specific protocols live behind
//! their own [`AvatarRenderer`] implementations.

use crate::avatar::{AvatarHandshake, AvatarRenderer, RendererInput, RendererOutput, RendererSession};
use crate::config::AvatarRef;
use crate::error::{AgentError, Result};
use crate::pipeline::messages::{AudioFrame, VideoFrame};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use url::Url;

/// Channel buffer sizes for one renderer session.
const RENDERER_INPUT_CHANNEL_SIZE: usize = 32;
const RENDERER_OUTPUT_CHANNEL_SIZE: usize = 32;

const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// Messages sent from the bridge to the renderer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Hello {
        display_name: String,
        participant_identity: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        avatar_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        avatar_image_b64: Option<String>,
    },
    Audio {
        samples_b64: String,
        sample_rate: u32,
        seq: u64,
        timestamp_ms: u64,
    },
    UtteranceEnd {
        utterance_id: u64,
    },
    Bye,
}

/// Messages received from the renderer.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Welcome {},
    Audio {
        samples_b64: String,
        sample_rate: u32,
        seq: u64,
        timestamp_ms: u64,
    },
    Video {
        data_b64: String,
        width: u32,
        height: u32,
        seq: u64,
        timestamp_ms: u64,
    },
    UtteranceAck {
        utterance_id: u64,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

/// Renderer client speaking wisp's WebSocket framing.
pub struct WsAvatarRenderer {
    endpoint: Url,
}

impl WsAvatarRenderer {
    /// Client for a renderer listening at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns a config error for an unparseable URL.
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| AgentError::Config(format!("invalid renderer endpoint: {e}")))?;
        Ok(Self { endpoint })
    }
}

#[async_trait]
impl AvatarRenderer for WsAvatarRenderer {
    async fn start(&self, handshake: AvatarHandshake) -> Result<RendererSession> {
        let (mut socket, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| AgentError::AvatarUnavailable(format!("renderer connect failed: {e}")))?;

        let hello = hello_message(&handshake).await?;
        let text = serde_json::to_string(&hello)
            .map_err(|e| AgentError::AvatarUnavailable(format!("handshake encode failed: {e}")))?;
        socket
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| AgentError::AvatarUnavailable(format!("handshake send failed: {e}")))?;

        // The renderer must confirm before any media flows.
        wait_for_welcome(&mut socket).await?;

        let (input_tx, mut input_rx) = mpsc::channel::<RendererInput>(RENDERER_INPUT_CHANNEL_SIZE);
        let (output_tx, output_rx) =
            mpsc::channel::<RendererOutput>(RENDERER_OUTPUT_CHANNEL_SIZE);

        let (mut write, mut read) = socket.split();

        // Writer: bridge input → wire.
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                let message = match input {
                    RendererInput::Audio(frame) => ClientMessage::Audio {
                        samples_b64: samples_to_b64(&frame.samples),
                        sample_rate: frame.sample_rate,
                        seq: frame.seq,
                        timestamp_ms: frame.timestamp.as_millis() as u64,
                    },
                    RendererInput::UtteranceEnd { utterance_id } => {
                        ClientMessage::UtteranceEnd { utterance_id }
                    }
                };
                let Ok(text) = serde_json::to_string(&message) else {
                    continue;
                };
                if write.send(WsMessage::Text(text.into())).await.is_err() {
                    debug!("renderer socket write side closed");
                    return;
                }
            }
            // Input channel closed: polite goodbye, best effort.
            if let Ok(text) = serde_json::to_string(&ClientMessage::Bye) {
                let _ = write.send(WsMessage::Text(text.into())).await;
            }
            let _ = write.close().await;
        });

        // Reader: wire → bridge output.
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let message = match message {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = output_tx
                            .send(RendererOutput::Closed {
                                reason: format!("renderer socket error: {e}"),
                            })
                            .await;
                        return;
                    }
                };
                let parsed: ServerMessage = match serde_json::from_str(message.as_ref()) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!("ignoring malformed renderer message: {e}");
                        continue;
                    }
                };
                let output = match parsed {
                    ServerMessage::Welcome {} => continue,
                    ServerMessage::Audio {
                        samples_b64,
                        sample_rate,
                        seq,
                        timestamp_ms,
                    } => RendererOutput::Audio(AudioFrame {
                        samples: b64_to_samples(&samples_b64),
                        sample_rate,
                        seq,
                        timestamp: Duration::from_millis(timestamp_ms),
                    }),
                    ServerMessage::Video {
                        data_b64,
                        width,
                        height,
                        seq,
                        timestamp_ms,
                    } => RendererOutput::Video(VideoFrame {
                        data: BASE64.decode(data_b64).unwrap_or_default(),
                        width,
                        height,
                        seq,
                        timestamp: Duration::from_millis(timestamp_ms),
                    }),
                    ServerMessage::UtteranceAck { utterance_id } => {
                        RendererOutput::UtteranceAck { utterance_id }
                    }
                    ServerMessage::Error { message } => {
                        let _ = output_tx
                            .send(RendererOutput::Closed { reason: message })
                            .await;
                        return;
                    }
                };
                if output_tx.send(output).await.is_err() {
                    return;
                }
            }
            let _ = output_tx
                .send(RendererOutput::Closed {
                    reason: "renderer closed the connection".to_owned(),
                })
                .await;
        });

        Ok(RendererSession {
            input_tx,
            output_rx,
        })
    }
}

/// Build the hello message, loading an image asset when the avatar is
/// referenced by file.
async fn hello_message(handshake: &AvatarHandshake) -> Result<ClientMessage> {
    let (avatar_id, avatar_image_b64) = match &handshake.avatar {
        AvatarRef::Id { id } => (Some(id.clone()), None),
        AvatarRef::Image { path } => {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                AgentError::AvatarUnavailable(format!(
                    "failed to read avatar image {}: {e}",
                    path.display()
                ))
            })?;
            (None, Some(BASE64.encode(bytes)))
        }
    };
    Ok(ClientMessage::Hello {
        display_name: handshake.display_name.clone(),
        participant_identity: handshake.participant_identity.to_string(),
        avatar_id,
        avatar_image_b64,
    })
}

/// Await the renderer's welcome, rejecting anything else.
async fn wait_for_welcome<S>(socket: &mut S) -> Result<()>
where
    S: Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let welcome = tokio::time::timeout(WELCOME_TIMEOUT, socket.next())
        .await
        .map_err(|_| AgentError::AvatarUnavailable("renderer welcome timed out".to_owned()))?;
    match welcome {
        Some(Ok(WsMessage::Text(text))) => {
            match serde_json::from_str::<ServerMessage>(text.as_ref()) {
                Ok(ServerMessage::Welcome {}) => Ok(()),
                Ok(ServerMessage::Error { message }) => Err(AgentError::AvatarUnavailable(
                    format!("renderer rejected handshake: {message}"),
                )),
                _ => Err(AgentError::AvatarUnavailable(
                    "unexpected renderer handshake reply".to_owned(),
                )),
            }
        }
        Some(Ok(_)) | None => Err(AgentError::AvatarUnavailable(
            "renderer closed during handshake".to_owned(),
        )),
        Some(Err(e)) => Err(AgentError::AvatarUnavailable(format!(
            "renderer handshake failed: {e}"
        ))),
    }
}

/// Encode f32 samples as little-endian bytes in base64.
fn samples_to_b64(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    BASE64.encode(bytes)
}

/// Decode base64 little-endian bytes into f32 samples.
fn b64_to_samples(encoded: &str) -> Vec<f32> {
    let Ok(bytes) = BASE64.decode(encoded) else {
        return Vec::new();
    };
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_survive_the_wire_encoding() {
        let samples = vec![0.0_f32, 0.5, -0.5, 1.0, -1.0, 0.125];
        let decoded = b64_to_samples(&samples_to_b64(&samples));
        assert_eq!(decoded, samples);
    }

    #[test]
    fn malformed_base64_decodes_to_empty() {
        assert!(b64_to_samples("not base64!!!").is_empty());
    }

    #[test]
    fn hello_serializes_with_tagged_type() {
        let message = ClientMessage::Hello {
            display_name: "Michael".into(),
            participant_identity: "avatar-agent".into(),
            avatar_id: Some("b9be11b8".into()),
            avatar_image_b64: None,
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["avatar_id"], "b9be11b8");
        assert!(value.get("avatar_image_b64").is_none());
    }

    #[test]
    fn server_messages_parse() {
        let ack: ServerMessage =
            serde_json::from_str(r#"{"type":"utterance_ack","utterance_id":7}"#).unwrap();
        assert!(matches!(
            ack,
            ServerMessage::UtteranceAck { utterance_id: 7 }
        ));
        let err: ServerMessage =
            serde_json::from_str(r#"{"type":"error","message":"no such avatar"}"#).unwrap();
        assert!(matches!(err, ServerMessage::Error { .. }));
    }
}
