//! Session events emitted by the pipeline for observability.
//!
//! This is intentionally lightweight (no heavy payloads) so stages can emit
//! events without blocking audio paths.

use crate::avatar::BridgeState;
use crate::pipeline::state::SessionState;

/// Events that describe what a session is doing "right now".
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The turn state machine advanced.
    StateChanged {
        /// Previous state.
        from: SessionState,
        /// New state.
        to: SessionState,
    },
    /// User transcript produced by STT.
    UserTranscript {
        /// Transcript text.
        text: String,
        /// Whether this is a final transcript (vs interim).
        is_final: bool,
    },
    /// The turn detector committed an end-of-user-turn.
    UserTurnCommitted {
        /// Committed turn text.
        text: String,
    },
    /// Agent sentence produced by the reasoning stage.
    AgentSentence {
        /// Sentence text.
        text: String,
        /// Whether this is the last sentence of the utterance.
        is_final: bool,
        /// Utterance the sentence belongs to.
        utterance_id: u64,
    },
    /// Tool call requested by the reasoning stage.
    ToolCall {
        /// Call identifier (stable across start/result).
        id: String,
        /// Tool name.
        name: String,
        /// JSON-encoded arguments.
        input_json: String,
    },
    /// Tool result.
    ToolResult {
        /// Call identifier this result corresponds to.
        id: String,
        /// Tool name.
        name: String,
        /// Whether the tool reported success.
        success: bool,
    },
    /// The tool-step cap was reached; the partial reply was surfaced and
    /// the session continues.
    ToolStepCapReached {
        /// Configured cap.
        max: u32,
    },
    /// Barge-in halted an in-flight utterance.
    Interrupted {
        /// Halted utterance.
        utterance_id: u64,
    },
    /// An utterance was fully delivered (to the room or the avatar bridge).
    UtterancePublished {
        /// Delivered utterance.
        utterance_id: u64,
    },
    /// Avatar bridge handshake/stream state changed.
    AvatarState {
        /// New bridge state.
        state: BridgeState,
    },
    /// The session fell back to direct room audio after an avatar failure.
    AvatarFallback {
        /// Renderer-reported reason.
        reason: String,
    },
}
