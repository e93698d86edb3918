//! Configuration types for the voice agent worker.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for one agent session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Worker registration and dispatch settings.
    pub worker: WorkerConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Reasoning model settings.
    pub llm: LlmConfig,
    /// Speech synthesis settings.
    pub tts: TtsConfig,
    /// End-of-user-turn detection settings.
    pub turn_detection: TurnDetectionConfig,
    /// Barge-in (interrupt) behavior while the agent is speaking.
    pub barge_in: BargeInConfig,
    /// Direct room media output settings.
    pub room_output: RoomOutputConfig,
    /// Avatar embodiment settings. `None` runs the session voice-only.
    pub avatar: Option<AvatarConfig>,
}

impl AgentConfig {
    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns a config error when the TOML is malformed or a section
    /// fails validation.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| AgentError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to TOML text.
    ///
    /// # Errors
    ///
    /// Returns a config error if serialization fails.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AgentError::Config(format!("failed to serialize config: {e}")))
    }

    /// Validate cross-section constraints.
    ///
    /// An attached avatar with direct room audio still enabled would publish
    /// two audio sources for one session, so that combination is rejected
    /// here rather than silently resolved.
    ///
    /// # Errors
    ///
    /// Returns a config error when an invariant is violated.
    pub fn validate(&self) -> Result<()> {
        if self.avatar.is_some() && self.room_output.audio_enabled {
            return Err(AgentError::Config(
                "avatar is configured but room_output.audio_enabled is true; \
                 disable direct room audio when the avatar publishes the voice"
                    .to_owned(),
            ));
        }
        if self.worker.agent_name.trim().is_empty() {
            return Err(AgentError::Config("worker.agent_name is empty".to_owned()));
        }
        if let Some(avatar) = &self.avatar {
            avatar.validate()?;
        }
        Ok(())
    }
}

/// Worker registration and dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Logical agent name the external dispatch layer routes job requests by.
    pub agent_name: String,
    /// Room connection timeout in ms.
    pub connect_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            agent_name: "wisp-agent".to_owned(),
            connect_timeout_ms: 10_000,
        }
    }
}

/// Voice activity detection backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadModelKind {
    /// RMS energy thresholding.
    #[default]
    Energy,
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Detection backend.
    pub model: VadModelKind,
    /// RMS energy threshold for speech detection.
    ///
    /// Audio frames with RMS above this value are classified as speech.
    pub threshold: f32,
    /// Minimum silence duration in ms to end a speech segment.
    pub min_silence_duration_ms: u32,
    /// Minimum speech duration in ms to consider a segment valid.
    pub min_speech_duration_ms: u32,
    /// Padding added around detected speech in ms.
    pub speech_pad_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            model: VadModelKind::Energy,
            threshold: 0.01,
            min_silence_duration_ms: 550,
            min_speech_duration_ms: 100,
            speech_pad_ms: 30,
        }
    }
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Vendor model identifier.
    pub model: String,
    /// BCP-47 language tag passed to the vendor.
    pub language: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            model: "nova-3".to_owned(),
            language: "en-US".to_owned(),
        }
    }
}

/// Reasoning model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Vendor model identifier.
    pub model: String,
    /// System prompt prepended to every conversation.
    pub system_prompt: String,
    /// Maximum number of sequential tool calls per reply.
    ///
    /// Exceeding the cap terminates the tool loop, surfaces whatever
    /// partial reply exists, and lets the session continue.
    pub max_tool_steps: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4.1".to_owned(),
            system_prompt: "You are a helpful voice assistant. Keep replies short \
                            and conversational."
                .to_owned(),
            max_tool_steps: 10,
        }
    }
}

/// Speech synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Vendor voice identifier.
    pub voice: String,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice: "default".to_owned(),
            sample_rate: 24_000,
        }
    }
}

/// End-of-user-turn detection model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnModel {
    /// Timing/confidence heuristic over final transcripts and silence.
    Heuristic,
}

/// End-of-user-turn detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnDetectionConfig {
    /// Detection model.
    pub model: TurnModel,
    /// Endpoint delay after a confident final transcript, in ms.
    pub min_endpoint_delay_ms: u64,
    /// Endpoint delay after a low-confidence final transcript, in ms.
    pub max_endpoint_delay_ms: u64,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            model: TurnModel::Heuristic,
            min_endpoint_delay_ms: 400,
            max_endpoint_delay_ms: 1500,
        }
    }
}

/// Barge-in behavior while the agent is responding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Whether user speech may interrupt an in-progress agent utterance.
    pub enabled: bool,
    /// Minimum RMS of user speech to count as barge-in.
    pub min_rms: f32,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_rms: 0.02,
        }
    }
}

/// Direct room media output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomOutputConfig {
    /// Whether synthesized audio is published directly to the room.
    ///
    /// Must be disabled when an avatar is attached: the avatar's rendered
    /// stream becomes the session's only audio source.
    pub audio_enabled: bool,
}

impl Default for RoomOutputConfig {
    fn default() -> Self {
        Self {
            audio_enabled: true,
        }
    }
}

/// Reference to the avatar the renderer should embody.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AvatarRef {
    /// An avatar registered with the renderer, addressed by id.
    Id {
        /// Renderer-side avatar identifier.
        id: String,
    },
    /// A still image asset the renderer animates.
    Image {
        /// Path to the image file.
        path: PathBuf,
    },
}

/// Policy applied when the avatar renderer handshake or stream fails.
///
/// There is deliberately no default: a deployment must choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvatarFailurePolicy {
    /// Fall back to direct room audio and continue without the avatar.
    DirectAudio,
    /// Fail the session start with an avatar-unavailable condition.
    FailSession,
}

/// Avatar embodiment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvatarConfig {
    /// Display name shown for the avatar participant.
    pub display_name: String,
    /// Participant identity the rendered tracks are published under.
    pub participant_identity: String,
    /// What to do when the renderer is unavailable. No default.
    pub on_failure: AvatarFailurePolicy,
    /// Maximum unacknowledged utterances in flight at the renderer before
    /// hand-off of further synthesized audio is suspended.
    #[serde(default = "default_max_inflight_utterances")]
    pub max_inflight_utterances: usize,
    /// Renderer handshake timeout in ms.
    #[serde(default = "default_avatar_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Which avatar the renderer should embody. Kept last so the tagged
    /// table serializes after the scalar keys.
    pub avatar: AvatarRef,
}

fn default_max_inflight_utterances() -> usize {
    2
}

fn default_avatar_connect_timeout_ms() -> u64 {
    10_000
}

impl AvatarConfig {
    fn validate(&self) -> Result<()> {
        if self.participant_identity.trim().is_empty() {
            return Err(AgentError::Config(
                "avatar.participant_identity is empty".to_owned(),
            ));
        }
        if self.max_inflight_utterances == 0 {
            return Err(AgentError::Config(
                "avatar.max_inflight_utterances must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.llm.max_tool_steps, 10);
        assert!(config.room_output.audio_enabled);
        assert!(config.avatar.is_none());
    }

    #[test]
    fn avatar_with_direct_audio_is_rejected() {
        let mut config = AgentConfig::default();
        config.avatar = Some(AvatarConfig {
            avatar: AvatarRef::Id { id: "a-1".into() },
            display_name: "Michael".into(),
            participant_identity: "avatar-agent".into(),
            on_failure: AvatarFailurePolicy::FailSession,
            max_inflight_utterances: 2,
            connect_timeout_ms: 10_000,
        });
        // room_output.audio_enabled defaults to true: two audio sources.
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));

        config.room_output.audio_enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn avatar_failure_policy_has_no_default() {
        let toml = r#"
            [room_output]
            audio_enabled = false

            [avatar]
            display_name = "Michael"
            participant_identity = "avatar-agent"

            [avatar.avatar]
            type = "id"
            id = "b9be11b8"
        "#;
        // Missing on_failure must not deserialize silently.
        assert!(AgentConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn toml_round_trip() {
        let mut config = AgentConfig::default();
        config.room_output.audio_enabled = false;
        config.avatar = Some(AvatarConfig {
            avatar: AvatarRef::Image {
                path: PathBuf::from("avatar.jpg"),
            },
            display_name: "Astrid".into(),
            participant_identity: "avatar-agent".into(),
            on_failure: AvatarFailurePolicy::DirectAudio,
            max_inflight_utterances: 4,
            connect_timeout_ms: 5_000,
        });

        let text = config.to_toml_string().unwrap();
        let parsed = AgentConfig::from_toml_str(&text).unwrap();
        let avatar = parsed.avatar.expect("avatar section survives round trip");
        assert_eq!(avatar.on_failure, AvatarFailurePolicy::DirectAudio);
        assert_eq!(avatar.max_inflight_utterances, 4);
        assert_eq!(
            avatar.avatar,
            AvatarRef::Image {
                path: PathBuf::from("avatar.jpg")
            }
        );
    }
}
