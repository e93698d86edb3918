//! Wisp: real-time voice agent worker with avatar embodiment.
//!
//! A worker accepts conversational job requests and runs one session
//! pipeline per accepted job:
//! Room audio → VAD → STT → turn detection → reasoning (with bounded tool
//! calls) → synthesis → room output.
//!
//! # Architecture
//!
//! The pipeline is built from independent stages connected by ordered
//! bounded channels:
//! - **Worker**: prewarms process-wide state, accepts/rejects job requests
//! - **Room connector**: publish/subscribe of named audio/video tracks
//! - **VAD**: detects speech boundaries using energy-based analysis
//! - **STT / reasoning / synthesis**: vendor stages behind uniform
//!   streaming contracts
//! - **Turn detector**: commits end-of-user-turn from transcripts + timing
//! - **Avatar bridge**: swaps the raw synthesized voice for an external
//!   renderer's lip-synced audio/video
//!
//! The session orchestrator owns the turn state machine and barge-in; see
//! [`pipeline::orchestrator`].

pub mod avatar;
pub mod config;
pub mod error;
pub mod events;
pub mod llm;
pub mod pipeline;
pub mod room;
pub mod stt;
pub mod test_utils;
pub mod tts;
pub mod turn;
pub mod vad;
pub mod worker;

pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use events::SessionEvent;
pub use pipeline::orchestrator::{SessionHandle, SessionOrchestrator, SessionStages};
pub use pipeline::state::{SessionState, TurnOwner};
pub use worker::{JobContext, JobHandler, JobRequest, Worker};
