//! Turn-taking state machine for one session.
//!
//! The orchestrator's control task owns a [`SessionState`] and advances it
//! with [`next_state`] as control events arrive from the stages. Keeping the
//! transition function pure makes the turn-ownership rules testable without
//! spinning up a pipeline.

use crate::pipeline::messages::ControlEvent;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Pipeline assembled, not yet listening (also transiently between an
    /// agent utterance completing and listening resuming).
    Idle,
    /// Waiting for user speech; the user owns the turn.
    Listening,
    /// End-of-user-turn committed; reasoning in progress.
    Thinking,
    /// Synthesized reply streaming out; the agent owns the turn.
    Responding,
    /// Barge-in detected; in-flight output is being halted.
    Interrupted,
    /// Session over (explicit stop or room disconnect).
    Ended,
}

/// Which party owns the conversational turn in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOwner {
    /// The user is (or may start) speaking.
    User,
    /// The agent is reasoning or speaking.
    Agent,
    /// Nobody owns the turn.
    None,
}

impl SessionState {
    /// Turn owner implied by this state. At most one owner at any instant
    /// follows from the state being a single value.
    pub fn turn_owner(self) -> TurnOwner {
        match self {
            Self::Listening => TurnOwner::User,
            Self::Thinking | Self::Responding => TurnOwner::Agent,
            // During barge-in the user has already taken over.
            Self::Interrupted => TurnOwner::User,
            Self::Idle | Self::Ended => TurnOwner::None,
        }
    }

    /// Whether the session has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended)
    }
}

/// Advance the state machine by one control event.
///
/// Events that do not apply in the current state leave it unchanged; stages
/// race against barge-in and cancellation, so stale events are expected and
/// ignored rather than treated as errors.
pub fn next_state(state: SessionState, event: &ControlEvent) -> SessionState {
    use ControlEvent::*;
    use SessionState::*;

    match (state, event) {
        (Ended, _) => Ended,

        (Idle, ResumeListening) => Listening,

        (Listening, UserTurnCommitted { .. } | ThinkingStarted) => Thinking,

        (Thinking, ReplyStarted { .. }) => Responding,
        // A tool-only or empty reply releases the turn without speaking.
        (Thinking, ReplyEmpty) => Idle,

        (Responding, UtteranceComplete { .. }) => Idle,
        (Responding, UserSpeechStart { .. }) => Interrupted,

        (Interrupted, UtteranceHalted { .. }) => Idle,

        _ => state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit() -> ControlEvent {
        ControlEvent::UserTurnCommitted {
            text: "hello".into(),
        }
    }

    #[test]
    fn listen_think_respond_cycle() {
        let s = SessionState::Idle;
        let s = next_state(s, &ControlEvent::ResumeListening);
        assert_eq!(s, SessionState::Listening);
        let s = next_state(s, &commit());
        assert_eq!(s, SessionState::Thinking);
        let s = next_state(s, &ControlEvent::ReplyStarted { utterance_id: 1 });
        assert_eq!(s, SessionState::Responding);
        let s = next_state(s, &ControlEvent::UtteranceComplete { utterance_id: 1 });
        assert_eq!(s, SessionState::Idle);
        let s = next_state(s, &ControlEvent::ResumeListening);
        assert_eq!(s, SessionState::Listening);
    }

    #[test]
    fn barge_in_interrupts_then_resumes() {
        let s = SessionState::Responding;
        let s = next_state(s, &ControlEvent::UserSpeechStart { rms: 0.2 });
        assert_eq!(s, SessionState::Interrupted);
        let s = next_state(s, &ControlEvent::UtteranceHalted { utterance_id: 3 });
        assert_eq!(s, SessionState::Idle);
    }

    #[test]
    fn turn_ownership_is_exclusive() {
        // Listening and Responding can never hold simultaneously: the state
        // is one value, and their owners differ.
        assert_eq!(SessionState::Listening.turn_owner(), TurnOwner::User);
        assert_eq!(SessionState::Responding.turn_owner(), TurnOwner::Agent);
        assert_eq!(SessionState::Idle.turn_owner(), TurnOwner::None);
    }

    #[test]
    fn ended_is_absorbing() {
        let s = SessionState::Ended;
        assert_eq!(next_state(s, &commit()), SessionState::Ended);
        assert_eq!(
            next_state(s, &ControlEvent::ResumeListening),
            SessionState::Ended
        );
        assert!(s.is_terminal());
    }

    #[test]
    fn stale_events_are_ignored() {
        // An utterance-complete arriving after barge-in must not revive
        // the response.
        let s = SessionState::Interrupted;
        assert_eq!(
            next_state(s, &ControlEvent::UtteranceComplete { utterance_id: 1 }),
            SessionState::Interrupted
        );
        // Speech onset while listening is not a transition by itself; the
        // turn detector decides when the turn ends.
        let s = SessionState::Listening;
        assert_eq!(
            next_state(s, &ControlEvent::UserSpeechStart { rms: 0.5 }),
            SessionState::Listening
        );
    }

    #[test]
    fn empty_reply_releases_the_turn() {
        let s = next_state(SessionState::Thinking, &ControlEvent::ReplyEmpty);
        assert_eq!(s, SessionState::Idle);
    }
}
