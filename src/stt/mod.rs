//! Speech-to-text capability contract.
//!
//! The transcription vendor is an external collaborator; wisp defines the
//! streaming contract and lets implementations (or test fakes) bridge it to
//! a wire protocol.

use crate::error::Result;
use crate::pipeline::messages::{SpeechSegment, SttEvent};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Channel buffer sizes for one STT stream.
const STT_AUDIO_CHANNEL_SIZE: usize = 8;
const STT_EVENT_CHANNEL_SIZE: usize = 8;

/// One live transcription stream.
///
/// Feed speech segments into `audio_tx`; transcript events arrive on
/// `events` in FIFO order. Dropping `audio_tx` closes the stream; the
/// implementation ends `events` when its backend drains.
pub struct SttSession {
    /// Speech segments to transcribe.
    pub audio_tx: mpsc::Sender<SpeechSegment>,
    /// Interim/final transcript events.
    pub events: mpsc::Receiver<SttEvent>,
}

impl SttSession {
    /// Create a connected channel pair for an implementation to drive.
    ///
    /// Returns the session plus the implementation-side ends.
    pub fn channel() -> (Self, mpsc::Receiver<SpeechSegment>, mpsc::Sender<SttEvent>) {
        let (audio_tx, audio_rx) = mpsc::channel(STT_AUDIO_CHANNEL_SIZE);
        let (event_tx, events) = mpsc::channel(STT_EVENT_CHANNEL_SIZE);
        (Self { audio_tx, events }, audio_rx, event_tx)
    }
}

/// Streaming speech-to-text vendor contract.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Open a transcription stream for audio at `sample_rate`.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the vendor handshake fails.
    async fn start(&self, sample_rate: u32) -> Result<SttSession>;
}
