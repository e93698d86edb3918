//! Message types passed between pipeline stages.

use std::time::Duration;

/// A chunk of audio samples on one track.
///
/// `seq` is monotonic per track; `timestamp` is the media-clock offset from
/// session start, used for best-effort cross-track alignment.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Interleaved f32 samples, mono.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Monotonic sequence number within the track.
    pub seq: u64,
    /// Media-clock timestamp of the first sample.
    pub timestamp: Duration,
}

impl AudioFrame {
    /// RMS energy of the frame.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum_sq / self.samples.len() as f32).sqrt()
    }

    /// Duration covered by the samples.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// An encoded video frame on one track.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Encoded frame payload. Codec negotiation is the transport's concern.
    pub data: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Monotonic sequence number within the track.
    pub seq: u64,
    /// Media-clock timestamp.
    pub timestamp: Duration,
}

/// A complete speech segment detected by VAD, ready for STT.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    /// Concatenated audio samples for the entire utterance.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Media-clock timestamp of segment start.
    pub started_at: Duration,
}

/// A transcript event from the STT stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// Partial hypothesis, may still change.
    Interim {
        /// Hypothesis text.
        text: String,
    },
    /// Final transcription of a speech segment.
    Final {
        /// Transcribed text.
        text: String,
    },
}

/// A sentence accumulated from streamed reply tokens, ready for synthesis.
#[derive(Debug, Clone)]
pub struct SentenceChunk {
    /// Complete sentence text.
    pub text: String,
    /// Whether this is the last sentence of the utterance.
    pub is_final: bool,
    /// Utterance this sentence belongs to.
    pub utterance_id: u64,
}

/// Synthesized audio ready for publication or avatar hand-off.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    /// The synthesized frame.
    pub frame: AudioFrame,
    /// Utterance this frame belongs to.
    pub utterance_id: u64,
    /// Whether this is the last frame of the utterance.
    pub is_final: bool,
}

/// Low-latency control events flowing from stages to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// User speech onset detected by VAD.
    UserSpeechStart {
        /// RMS of the onset frame, for the barge-in threshold.
        rms: f32,
    },
    /// User speech ended (VAD silence window elapsed).
    UserSpeechEnd,
    /// The turn detector committed an end-of-user-turn.
    UserTurnCommitted {
        /// Full text of the committed turn.
        text: String,
    },
    /// The reasoning stage started working on a reply.
    ThinkingStarted,
    /// First synthesizable reply chunk produced.
    ReplyStarted {
        /// Utterance being produced.
        utterance_id: u64,
    },
    /// A reply produced no synthesizable text (for example, tool-only).
    ReplyEmpty,
    /// The last frame of an utterance was delivered downstream.
    UtteranceComplete {
        /// Completed utterance.
        utterance_id: u64,
    },
    /// In-flight output for an utterance was halted after barge-in.
    UtteranceHalted {
        /// Halted utterance.
        utterance_id: u64,
    },
    /// Internal: the session resumes listening after an utterance settles.
    ResumeListening,
    /// The avatar renderer stream failed mid-session.
    AvatarFailed {
        /// Renderer-reported reason.
        reason: String,
    },
}

/// A one-shot, system-directed reply request, queued into the reasoning
/// stage outside the normal listen/think loop.
#[derive(Debug, Clone)]
pub struct ReplyCommand {
    /// Instructions for the utterance (not spoken verbatim).
    pub instructions: String,
}

/// One entry of the append-only session transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEntry {
    /// A committed user turn.
    User {
        /// Transcribed text.
        text: String,
    },
    /// An agent reply (possibly partial, when interrupted or capped).
    Agent {
        /// Reply text.
        text: String,
    },
    /// A tool invocation made while producing a reply.
    ToolCall {
        /// Tool name.
        name: String,
        /// JSON-encoded arguments.
        args: String,
        /// Whether the tool reported success.
        success: bool,
    },
}
