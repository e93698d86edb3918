//! Error types for the wisp agent worker.

/// Top-level error type for the voice agent worker.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Room or vendor session handshake failure (timeout, rejected auth).
    ///
    /// Retry policy belongs to the caller; wisp never retries internally.
    #[error("connection error: {0}")]
    Connection(String),

    /// Tool-step cap exhausted during a reasoning round-trip.
    ///
    /// Recovered locally: the partial reply is surfaced and the session
    /// continues.
    #[error("capacity error: tool-step cap of {max} reached")]
    Capacity {
        /// Configured maximum number of tool steps per reply.
        max: u32,
    },

    /// Avatar renderer handshake or stream failure.
    #[error("avatar unavailable: {0}")]
    AvatarUnavailable(String),

    /// Expected mid-utterance cancellation from barge-in. Not a failure.
    #[error("stream interrupted")]
    StreamInterrupted,

    /// Prewarm failure. Fatal to the entire worker process.
    #[error("prewarm failure: {0}")]
    Prewarm(String),

    /// Room media error (publish/subscribe/track lifecycle).
    #[error("room error: {0}")]
    Room(String),

    /// Voice activity detection error.
    #[error("VAD error: {0}")]
    Vad(String),

    /// Speech-to-text transcription error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model inference error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
