//! Speech synthesis capability contract.
//!
//! Synthesis is sentence-granular: the orchestrator hands each complete
//! sentence to the synthesizer while the reasoning stage is still streaming
//! later tokens, so early audio plays before the full reply exists.

use crate::error::Result;
use crate::pipeline::messages::AudioFrame;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Streaming text-to-speech vendor contract.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize one sentence; frames arrive on the receiver in order,
    /// and the channel closes when the sentence is fully rendered.
    ///
    /// # Errors
    ///
    /// Returns a synthesis error if the vendor rejects the request.
    async fn synthesize(&self, text: &str) -> Result<mpsc::Receiver<AudioFrame>>;

    /// Output sample rate in Hz.
    fn sample_rate(&self) -> u32;
}
