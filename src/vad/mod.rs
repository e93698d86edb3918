//! Voice activity detection using energy-based analysis.
//!
//! [`VadModel`] is the process-wide prewarmed resource: loaded once by the
//! worker before any job runs and shared read-only by every session. Each
//! session drives its own [`VadStream`], which holds the mutable windowing
//! state.

use crate::config::VadConfig;
use crate::error::Result;
use crate::pipeline::messages::{AudioFrame, SpeechSegment};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Immutable detection parameters shared by all sessions.
#[derive(Debug)]
pub struct VadModel {
    threshold: f32,
    min_silence: Duration,
    min_speech: Duration,
    pad: Duration,
}

impl VadModel {
    /// Load the detection model from configuration.
    ///
    /// This is the expensive, once-per-process step; sessions only borrow
    /// the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable.
    pub fn load(config: &VadConfig) -> Result<Arc<Self>> {
        let model = Self {
            threshold: config.threshold,
            min_silence: Duration::from_millis(u64::from(config.min_silence_duration_ms)),
            min_speech: Duration::from_millis(u64::from(config.min_speech_duration_ms)),
            pad: Duration::from_millis(u64::from(config.speech_pad_ms)),
        };
        info!(
            "VAD loaded: model={:?}, threshold={}, min_silence={}ms, min_speech={}ms",
            config.model,
            model.threshold,
            model.min_silence.as_millis(),
            model.min_speech.as_millis()
        );
        Ok(Arc::new(model))
    }
}

/// Output of feeding one frame into a [`VadStream`].
#[derive(Debug, Clone)]
pub enum VadEvent {
    /// Speech onset detected.
    SpeechStart {
        /// RMS of the onset frame.
        rms: f32,
    },
    /// A complete speech segment ended (silence window elapsed).
    SegmentEnd(SpeechSegment),
}

/// Per-session detection state.
pub struct VadStream {
    model: Arc<VadModel>,
    speech_buffer: Vec<f32>,
    in_speech: bool,
    silence: Duration,
    segment_start: Duration,
    sample_rate: u32,
}

impl VadStream {
    /// Create a fresh stream over the shared model.
    pub fn new(model: Arc<VadModel>) -> Self {
        Self {
            model,
            speech_buffer: Vec::new(),
            in_speech: false,
            silence: Duration::ZERO,
            segment_start: Duration::ZERO,
            sample_rate: 0,
        }
    }

    /// Feed one audio frame; returns a detection event when one fires.
    pub fn process(&mut self, frame: &AudioFrame) -> Option<VadEvent> {
        let rms = frame.rms();
        let is_speech = rms > self.model.threshold;
        self.sample_rate = frame.sample_rate;

        if is_speech {
            self.silence = Duration::ZERO;
            self.speech_buffer.extend_from_slice(&frame.samples);
            if !self.in_speech {
                self.in_speech = true;
                self.segment_start = frame.timestamp.saturating_sub(self.model.pad);
                return Some(VadEvent::SpeechStart { rms });
            }
            return None;
        }

        if !self.in_speech {
            return None;
        }

        // Silence inside a segment: keep buffering until the window elapses.
        self.speech_buffer.extend_from_slice(&frame.samples);
        self.silence += frame.duration();
        if self.silence < self.model.min_silence {
            return None;
        }

        self.in_speech = false;
        self.silence = Duration::ZERO;
        let samples = std::mem::take(&mut self.speech_buffer);
        let spoken = Duration::from_secs_f64(samples.len() as f64 / f64::from(self.sample_rate));
        if spoken < self.model.min_speech {
            return None;
        }
        Some(VadEvent::SegmentEnd(SpeechSegment {
            samples,
            sample_rate: self.sample_rate,
            started_at: self.segment_start,
        }))
    }

    /// Reset the per-session state.
    pub fn reset(&mut self) {
        self.speech_buffer.clear();
        self.in_speech = false;
        self.silence = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64, amplitude: f32, millis: u64) -> AudioFrame {
        let sample_rate = 16_000;
        let n = (sample_rate as u64 * millis / 1000) as usize;
        AudioFrame {
            samples: vec![amplitude; n],
            sample_rate,
            seq,
            timestamp: Duration::from_millis(seq * millis),
        }
    }

    fn model() -> Arc<VadModel> {
        VadModel::load(&VadConfig::default()).unwrap()
    }

    #[test]
    fn detects_speech_onset_and_segment_end() {
        let mut stream = VadStream::new(model());

        let onset = stream.process(&frame(0, 0.2, 100));
        assert!(matches!(onset, Some(VadEvent::SpeechStart { .. })));

        // More speech, no second onset.
        assert!(stream.process(&frame(1, 0.2, 100)).is_none());

        // Silence frames until the window elapses.
        let mut segment = None;
        for seq in 2..10 {
            if let Some(VadEvent::SegmentEnd(s)) = stream.process(&frame(seq, 0.0, 100)) {
                segment = Some(s);
                break;
            }
        }
        let segment = segment.expect("segment after silence window");
        assert!(!segment.samples.is_empty());
        assert_eq!(segment.sample_rate, 16_000);
    }

    #[test]
    fn too_short_speech_is_discarded() {
        // The buffer keeps trailing silence, so the minimum must exceed
        // burst + silence window for the discard path to trigger.
        let config = VadConfig {
            min_speech_duration_ms: 1000,
            ..VadConfig::default()
        };
        let model = VadModel::load(&config).unwrap();
        let mut stream = VadStream::new(model);

        assert!(matches!(
            stream.process(&frame(0, 0.3, 100)),
            Some(VadEvent::SpeechStart { .. })
        ));
        let mut fired = false;
        for seq in 1..4 {
            if let Some(VadEvent::SegmentEnd(_)) = stream.process(&frame(seq, 0.0, 200)) {
                fired = true;
            }
        }
        assert!(!fired, "sub-minimum segment must be discarded");
    }

    #[test]
    fn silence_alone_emits_nothing() {
        let mut stream = VadStream::new(model());
        for seq in 0..20 {
            assert!(stream.process(&frame(seq, 0.0, 100)).is_none());
        }
    }
}
