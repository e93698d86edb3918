//! End-of-user-turn detection.
//!
//! A turn ends when a final transcript is followed by enough silence. The
//! endpoint delay scales with a confidence heuristic over the transcript
//! text: a completed-sounding sentence commits fast, a trailing fragment
//! waits longer in case the user continues.

use crate::config::TurnDetectionConfig;
use crate::pipeline::messages::SttEvent;
use std::time::Duration;

/// Per-session end-of-turn detector.
///
/// The detector is a synchronous state machine; the owning stage supplies
/// the clock by arming a timer with the returned endpoint delay.
pub struct TurnDetector {
    min_delay: Duration,
    max_delay: Duration,
    pending: String,
}

impl TurnDetector {
    /// Create a detector from configuration.
    pub fn new(config: &TurnDetectionConfig) -> Self {
        Self {
            min_delay: Duration::from_millis(config.min_endpoint_delay_ms),
            max_delay: Duration::from_millis(config.max_endpoint_delay_ms),
            pending: String::new(),
        }
    }

    /// Observe a transcript event.
    ///
    /// Returns the endpoint delay to arm when the event was a final
    /// transcript; `None` means keep waiting.
    pub fn observe(&mut self, event: &SttEvent) -> Option<Duration> {
        match event {
            SttEvent::Interim { .. } => None,
            SttEvent::Final { text } => {
                let text = text.trim();
                if text.is_empty() {
                    return None;
                }
                if !self.pending.is_empty() {
                    self.pending.push(' ');
                }
                self.pending.push_str(text);
                Some(self.endpoint_delay())
            }
        }
    }

    /// Whether a turn is pending commit.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Commit the pending turn, returning its full text.
    pub fn commit(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    /// Confidence heuristic: terminal punctuation means the user likely
    /// finished; fragments get the long endpoint.
    fn endpoint_delay(&self) -> Duration {
        let finished = self
            .pending
            .trim_end()
            .ends_with(['.', '!', '?']);
        if finished { self.min_delay } else { self.max_delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> TurnDetector {
        TurnDetector::new(&TurnDetectionConfig::default())
    }

    #[test]
    fn punctuated_final_commits_fast() {
        let mut d = detector();
        let delay = d
            .observe(&SttEvent::Final {
                text: "What is the weather today?".into(),
            })
            .expect("final arms the endpoint timer");
        assert_eq!(delay, Duration::from_millis(400));
    }

    #[test]
    fn fragment_waits_longer() {
        let mut d = detector();
        let delay = d
            .observe(&SttEvent::Final {
                text: "so what I wanted to".into(),
            })
            .unwrap();
        assert_eq!(delay, Duration::from_millis(1500));
    }

    #[test]
    fn interim_events_do_not_arm_the_timer() {
        let mut d = detector();
        assert!(
            d.observe(&SttEvent::Interim {
                text: "what is".into()
            })
            .is_none()
        );
        assert!(!d.has_pending());
    }

    #[test]
    fn finals_accumulate_into_one_turn() {
        let mut d = detector();
        d.observe(&SttEvent::Final {
            text: "first part".into(),
        });
        d.observe(&SttEvent::Final {
            text: "second part.".into(),
        });
        assert_eq!(d.commit().unwrap(), "first part second part.");
        assert!(d.commit().is_none());
    }

    #[test]
    fn empty_finals_are_ignored() {
        let mut d = detector();
        assert!(
            d.observe(&SttEvent::Final { text: "  ".into() })
                .is_none()
        );
        assert!(!d.has_pending());
    }
}
