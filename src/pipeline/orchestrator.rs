//! Session orchestrator: wires the per-session pipeline stages together.
//!
//! Stages run as independent tasks connected by ordered bounded channels:
//!
//! room audio → VAD → STT → turn detector → reasoning → synthesis → output
//!
//! Each stream is FIFO; pipelining falls out of the channels (early reply
//! sentences synthesize while reasoning still streams later tokens). A
//! control task owns the turn state machine and the barge-in policy, and a
//! `CancellationToken` stops every stage promptly without touching other
//! sessions.

use crate::avatar::{AvatarBridge, AvatarRenderer};
use crate::config::{AgentConfig, AvatarFailurePolicy, BargeInConfig, LlmConfig};
use crate::error::{AgentError, Result};
use crate::events::SessionEvent;
use crate::llm::{
    Message, ReasoningEngine, ReplyContext, StopReason, ToolRegistry, run_reply,
};
use crate::pipeline::messages::{
    AudioFrame, ControlEvent, ReplyCommand, SentenceChunk, SpeechSegment, SttEvent,
    SynthesizedAudio, TranscriptEntry,
};
use crate::pipeline::state::{SessionState, next_state};
use crate::room::{Room, TrackOptions};
use crate::stt::SpeechToText;
use crate::tts::SpeechSynthesizer;
use crate::turn::TurnDetector;
use crate::vad::{VadEvent, VadModel, VadStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Channel buffer sizes.
const SEGMENT_CHANNEL_SIZE: usize = 8;
const STT_EVENT_CHANNEL_SIZE: usize = 8;
const TURN_CHANNEL_SIZE: usize = 4;
const SENTENCE_CHANNEL_SIZE: usize = 8;
const SYNTH_CHANNEL_SIZE: usize = 16;
const REPLY_COMMAND_CHANNEL_SIZE: usize = 8;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Track name for the agent's direct voice.
const AGENT_AUDIO_TRACK: &str = "agent-voice";

/// Expected capture sample rate hint for the STT vendor.
const STT_SAMPLE_RATE: u32 = 16_000;

/// The streaming vendor stages one session runs on.
pub struct SessionStages {
    /// Transcription vendor.
    pub stt: Arc<dyn SpeechToText>,
    /// Reasoning vendor.
    pub llm: Arc<dyn ReasoningEngine>,
    /// Synthesis vendor.
    pub tts: Arc<dyn SpeechSynthesizer>,
    /// Tools offered to the reasoning vendor.
    pub tools: Arc<ToolRegistry>,
}

/// Commands sent to the output router.
#[derive(Debug)]
enum OutputCommand {
    /// Stop publishing frames of this utterance (barge-in).
    HaltUtterance {
        utterance_id: u64,
    },
    /// The avatar is gone; publish directly from now on.
    FallbackDirect,
}

/// Speech-boundary notifications for the turn detector.
#[derive(Debug, Clone, Copy)]
enum SpeechActivity {
    Started,
    Stopped,
}

/// Orchestrates one session's pipeline.
pub struct SessionOrchestrator {
    config: AgentConfig,
    stages: SessionStages,
    vad: Arc<VadModel>,
    room: Arc<dyn Room>,
    avatar_renderer: Option<Arc<dyn AvatarRenderer>>,
    cancel: CancellationToken,
}

impl SessionOrchestrator {
    /// Create an orchestrator for one accepted job.
    pub fn new(
        config: AgentConfig,
        stages: SessionStages,
        vad: Arc<VadModel>,
        room: Arc<dyn Room>,
    ) -> Self {
        Self {
            config,
            stages,
            vad,
            room,
            avatar_renderer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach an avatar renderer. The avatar itself is configured in
    /// [`AgentConfig::avatar`]; without that section the renderer is
    /// rejected at start.
    pub fn with_avatar_renderer(mut self, renderer: Arc<dyn AvatarRenderer>) -> Self {
        self.avatar_renderer = Some(renderer);
        self
    }

    /// Tie the session's lifetime to an outer scope (normally the job's
    /// cancellation token).
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start the pipeline: attach the avatar bridge (before any output),
    /// spawn the stages, and begin listening.
    ///
    /// # Errors
    ///
    /// Returns a config error for invalid wiring, a connection error if the
    /// room subscription fails, and [`AgentError::AvatarUnavailable`] when
    /// the avatar handshake fails under the fail-session policy; in that
    /// case the session never starts listening.
    pub async fn start(self) -> Result<SessionHandle> {
        self.config.validate()?;

        let cancel = self.cancel.clone();
        let (events_tx, _) = broadcast::channel::<SessionEvent>(EVENT_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel::<ControlEvent>();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        // The avatar bridge must exist before any output is produced, so
        // the first utterance already flows through the renderer.
        let mut direct_audio = self.config.room_output.audio_enabled;
        let mut failure_policy = None;
        let bridge = match (&self.config.avatar, &self.avatar_renderer) {
            (None, None) => None,
            (None, Some(_)) => {
                return Err(AgentError::Config(
                    "avatar renderer supplied but no [avatar] config section".to_owned(),
                ));
            }
            (Some(_), None) => {
                return Err(AgentError::Config(
                    "[avatar] configured but no renderer supplied".to_owned(),
                ));
            }
            (Some(avatar_cfg), Some(renderer)) => {
                failure_policy = Some(avatar_cfg.on_failure);
                match AvatarBridge::start(
                    Arc::clone(renderer),
                    avatar_cfg,
                    Arc::clone(&self.room),
                    control_tx.clone(),
                    Some(events_tx.clone()),
                    cancel.clone(),
                )
                .await
                {
                    Ok(bridge) => Some(bridge),
                    Err(e) => match avatar_cfg.on_failure {
                        AvatarFailurePolicy::FailSession => {
                            cancel.cancel();
                            return Err(e);
                        }
                        AvatarFailurePolicy::DirectAudio => {
                            warn!("avatar unavailable, falling back to direct audio: {e}");
                            let _ = events_tx.send(SessionEvent::AvatarFallback {
                                reason: e.to_string(),
                            });
                            direct_audio = true;
                            None
                        }
                    },
                }
            }
        };

        let audio_rx = self.room.subscribe_audio().await?;

        let interrupt = Arc::new(AtomicBool::new(false));
        let transcript: Arc<Mutex<Vec<TranscriptEntry>>> = Arc::new(Mutex::new(Vec::new()));

        let (segment_tx, segment_rx) = mpsc::channel::<SpeechSegment>(SEGMENT_CHANNEL_SIZE);
        let (stt_event_tx, stt_event_rx) = mpsc::channel::<SttEvent>(STT_EVENT_CHANNEL_SIZE);
        let (activity_tx, activity_rx) = mpsc::unbounded_channel::<SpeechActivity>();
        let (turn_tx, turn_rx) = mpsc::channel::<String>(TURN_CHANNEL_SIZE);
        let (sentence_tx, sentence_rx) = mpsc::channel::<SentenceChunk>(SENTENCE_CHANNEL_SIZE);
        let (synth_tx, synth_rx) = mpsc::channel::<SynthesizedAudio>(SYNTH_CHANNEL_SIZE);
        let (reply_tx, reply_rx) = mpsc::channel::<ReplyCommand>(REPLY_COMMAND_CHANNEL_SIZE);
        let (out_cmd_tx, out_cmd_rx) = mpsc::unbounded_channel::<OutputCommand>();

        // Stage 1: VAD over the room's remote audio.
        {
            let vad = VadStream::new(Arc::clone(&self.vad));
            let control_tx = control_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_vad_stage(vad, audio_rx, segment_tx, control_tx, activity_tx, cancel).await;
            });
        }

        // Stage 2: STT (vendor).
        {
            let stt = Arc::clone(&self.stages.stt);
            let events = events_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_stt_stage(stt, segment_rx, stt_event_tx, events, cancel).await;
            });
        }

        // Stage 3: end-of-turn detection.
        {
            let detector = TurnDetector::new(&self.config.turn_detection);
            let control_tx = control_tx.clone();
            let events = events_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_turn_stage(
                    detector, stt_event_rx, activity_rx, turn_tx, control_tx, events, cancel,
                )
                .await;
            });
        }

        // Stage 4: reasoning with bounded tool loop.
        {
            let engine = Arc::clone(&self.stages.llm);
            let registry = Arc::clone(&self.stages.tools);
            let llm_config = self.config.llm.clone();
            let control_tx = control_tx.clone();
            let events = events_tx.clone();
            let transcript = Arc::clone(&transcript);
            let interrupt = Arc::clone(&interrupt);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_llm_stage(
                    engine, registry, llm_config, turn_rx, reply_rx, sentence_tx, control_tx,
                    events, transcript, interrupt, cancel,
                )
                .await;
            });
        }

        // Stage 5: synthesis (vendor).
        {
            let tts = Arc::clone(&self.stages.tts);
            let interrupt = Arc::clone(&interrupt);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_tts_stage(tts, sentence_rx, synth_tx, interrupt, cancel).await;
            });
        }

        // Stage 6: output routing (direct track, avatar bridge, or muted).
        {
            let route = match &bridge {
                Some(bridge) => OutputRoute::Bridge(bridge.sink()),
                None if direct_audio => {
                    let publication = self
                        .room
                        .publish_audio_track(TrackOptions {
                            name: AGENT_AUDIO_TRACK.to_owned(),
                            participant: self.room.local_identity(),
                        })
                        .await?;
                    OutputRoute::Direct(Box::new(publication))
                }
                None => OutputRoute::Muted,
            };
            let room = Arc::clone(&self.room);
            let control_tx = control_tx.clone();
            let events = events_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_output_router(route, room, synth_rx, out_cmd_rx, control_tx, events, cancel)
                    .await;
            });
        }

        // Control task: the state machine plus barge-in and avatar policy.
        {
            let ctl = ControlCtx {
                barge_in: self.config.barge_in.clone(),
                failure_policy,
                state_tx,
                out_cmd_tx,
                interrupt: Arc::clone(&interrupt),
                events: events_tx.clone(),
                cancel: cancel.clone(),
            };
            tokio::spawn(async move {
                run_control_task(control_rx, ctl).await;
            });
        }

        info!("session pipeline started");
        Ok(SessionHandle {
            cancel,
            reply_tx,
            state_rx,
            events_tx,
            transcript,
        })
    }
}

/// Handle to a running session.
#[derive(Debug)]
pub struct SessionHandle {
    cancel: CancellationToken,
    reply_tx: mpsc::Sender<ReplyCommand>,
    state_rx: watch::Receiver<SessionState>,
    events_tx: broadcast::Sender<SessionEvent>,
    transcript: Arc<Mutex<Vec<TranscriptEntry>>>,
}

impl SessionHandle {
    /// Queue a one-shot, system-directed utterance (for example a
    /// proactive greeting). It runs behind any in-flight response rather
    /// than interleaving audio mid-utterance.
    ///
    /// # Errors
    ///
    /// Returns a channel error after the session ended.
    pub async fn generate_reply(&self, instructions: impl Into<String>) -> Result<()> {
        self.reply_tx
            .send(ReplyCommand {
                instructions: instructions.into(),
            })
            .await
            .map_err(|_| AgentError::Channel("session ended".to_owned()))
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Watch the turn state machine.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Snapshot of the append-only transcript so far.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.lock().expect("transcript poisoned").clone()
    }

    /// Stop the session: cancels every stage promptly and releases the
    /// scoped room resources.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Token tied to the session's lifetime.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

// ── Stage runner functions ───────────────────────────────────────────

async fn run_vad_stage(
    mut vad: VadStream,
    mut audio_rx: mpsc::Receiver<AudioFrame>,
    segment_tx: mpsc::Sender<SpeechSegment>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    activity_tx: mpsc::UnboundedSender<SpeechActivity>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = audio_rx.recv() => match frame {
                Some(frame) => frame,
                None => {
                    // Remote audio gone means the room is gone; end the
                    // session rather than listening to nothing.
                    info!("room audio ended, stopping session");
                    cancel.cancel();
                    break;
                }
            },
        };
        match vad.process(&frame) {
            Some(VadEvent::SpeechStart { rms }) => {
                let _ = control_tx.send(ControlEvent::UserSpeechStart { rms });
                let _ = activity_tx.send(SpeechActivity::Started);
            }
            Some(VadEvent::SegmentEnd(segment)) => {
                let _ = control_tx.send(ControlEvent::UserSpeechEnd);
                let _ = activity_tx.send(SpeechActivity::Stopped);
                if segment_tx.send(segment).await.is_err() {
                    break;
                }
            }
            None => {}
        }
    }
}

async fn run_stt_stage(
    stt: Arc<dyn SpeechToText>,
    mut segment_rx: mpsc::Receiver<SpeechSegment>,
    stt_event_tx: mpsc::Sender<SttEvent>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut session = match stt.start(STT_SAMPLE_RATE).await {
        Ok(session) => session,
        Err(e) => {
            error!("failed to start STT stream: {e}");
            cancel.cancel();
            return;
        }
    };

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            segment = segment_rx.recv() => {
                let Some(segment) = segment else { break };
                if session.audio_tx.send(segment).await.is_err() {
                    error!("STT stream dropped mid-session");
                    cancel.cancel();
                    break;
                }
            }
            event = session.events.recv() => {
                let Some(event) = event else {
                    warn!("STT event stream ended");
                    cancel.cancel();
                    break;
                };
                let (text, is_final) = match &event {
                    SttEvent::Interim { text } => (text.clone(), false),
                    SttEvent::Final { text } => (text.clone(), true),
                };
                let _ = events.send(SessionEvent::UserTranscript { text, is_final });
                if stt_event_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn run_turn_stage(
    mut detector: TurnDetector,
    mut stt_rx: mpsc::Receiver<SttEvent>,
    mut activity_rx: mpsc::UnboundedReceiver<SpeechActivity>,
    turn_tx: mpsc::Sender<String>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        // Rebuilt every iteration so re-arming the deadline takes effect.
        let endpoint = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            () = cancel.cancelled() => break,
            event = stt_rx.recv() => {
                let Some(event) = event else { break };
                if let Some(delay) = detector.observe(&event) {
                    deadline = Some(Instant::now() + delay);
                }
            }
            activity = activity_rx.recv() => {
                match activity {
                    // The user kept talking; hold the endpoint until the
                    // next final transcript re-arms it.
                    Some(SpeechActivity::Started) => deadline = None,
                    Some(SpeechActivity::Stopped) => {}
                    None => break,
                }
            }
            () = endpoint => {
                deadline = None;
                if let Some(text) = detector.commit() {
                    let _ = events.send(SessionEvent::UserTurnCommitted { text: text.clone() });
                    let _ = control_tx.send(ControlEvent::UserTurnCommitted { text: text.clone() });
                    if turn_tx.send(text).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Inputs the reasoning stage serializes: committed user turns and queued
/// reply commands, strictly in arrival order per channel.
#[allow(clippy::too_many_arguments)]
async fn run_llm_stage(
    engine: Arc<dyn ReasoningEngine>,
    registry: Arc<ToolRegistry>,
    config: LlmConfig,
    mut turn_rx: mpsc::Receiver<String>,
    mut reply_rx: mpsc::Receiver<ReplyCommand>,
    sentence_tx: mpsc::Sender<SentenceChunk>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    events: broadcast::Sender<SessionEvent>,
    transcript: Arc<Mutex<Vec<TranscriptEntry>>>,
    interrupt: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    enum Input {
        Turn(String),
        Command(ReplyCommand),
    }

    let mut history = vec![Message::system(config.system_prompt.clone())];
    let mut next_utterance: u64 = 0;

    loop {
        let input = tokio::select! {
            () = cancel.cancelled() => break,
            turn = turn_rx.recv() => match turn {
                Some(turn) => Input::Turn(turn),
                None => break,
            },
            command = reply_rx.recv() => match command {
                Some(command) => Input::Command(command),
                None => break,
            },
        };

        match &input {
            Input::Turn(text) => {
                transcript
                    .lock()
                    .expect("transcript poisoned")
                    .push(TranscriptEntry::User { text: text.clone() });
                history.push(Message::user(text.clone()));
            }
            Input::Command(command) => {
                // System-directed utterance: steer the next reply without
                // fabricating a user turn.
                history.push(Message::system(command.instructions.clone()));
            }
        }

        next_utterance += 1;
        let utterance_id = next_utterance;
        interrupt.store(false, Ordering::Relaxed);
        let _ = control_tx.send(ControlEvent::ThinkingStarted);

        let output = run_reply(
            engine.as_ref(),
            &mut history,
            ReplyContext {
                registry: &registry,
                max_tool_steps: config.max_tool_steps,
                utterance_id,
                sentence_tx: &sentence_tx,
                control_tx: &control_tx,
                events: Some(&events),
                interrupt: &interrupt,
            },
        )
        .await;

        match output {
            Ok(output) => {
                {
                    let mut transcript = transcript.lock().expect("transcript poisoned");
                    for call in &output.tool_calls {
                        transcript.push(TranscriptEntry::ToolCall {
                            name: call.name.clone(),
                            args: call.args.clone(),
                            success: call.success,
                        });
                    }
                    if !output.text.trim().is_empty() {
                        transcript.push(TranscriptEntry::Agent {
                            text: output.text.clone(),
                        });
                    }
                }
                if output.text.trim().is_empty()
                    && !matches!(output.stop, StopReason::Interrupted)
                {
                    let _ = control_tx.send(ControlEvent::ReplyEmpty);
                }
            }
            Err(e) => {
                // Vendor failure degrades to a skipped reply; the session
                // keeps listening. The final marker closes the utterance
                // downstream in case sentences already went out.
                error!("reasoning failed: {e}");
                let _ = control_tx.send(ControlEvent::ReplyEmpty);
                let _ = sentence_tx
                    .send(SentenceChunk {
                        text: String::new(),
                        is_final: true,
                        utterance_id,
                    })
                    .await;
            }
        }
    }
}

async fn run_tts_stage(
    tts: Arc<dyn SpeechSynthesizer>,
    mut sentence_rx: mpsc::Receiver<SentenceChunk>,
    synth_tx: mpsc::Sender<SynthesizedAudio>,
    interrupt: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => break,
            chunk = sentence_rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        if !chunk.text.is_empty() && !interrupt.load(Ordering::Relaxed) {
            match tts.synthesize(&chunk.text).await {
                Ok(mut frames) => loop {
                    let frame = tokio::select! {
                        () = cancel.cancelled() => return,
                        frame = frames.recv() => match frame {
                            Some(frame) => frame,
                            None => break,
                        },
                    };
                    if interrupt.load(Ordering::Relaxed) {
                        // Barge-in: abandon the rest of this sentence.
                        break;
                    }
                    if synth_tx
                        .send(SynthesizedAudio {
                            frame,
                            utterance_id: chunk.utterance_id,
                            is_final: false,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                },
                Err(e) => warn!("synthesis failed, skipping sentence: {e}"),
            }
        }

        if chunk.is_final {
            // Close the utterance downstream even when frames were skipped.
            let marker = SynthesizedAudio {
                frame: AudioFrame {
                    samples: Vec::new(),
                    sample_rate: tts.sample_rate(),
                    seq: 0,
                    timestamp: Duration::ZERO,
                },
                utterance_id: chunk.utterance_id,
                is_final: true,
            };
            if synth_tx.send(marker).await.is_err() {
                break;
            }
        }
    }
}

/// Where synthesized audio goes.
enum OutputRoute {
    /// Straight onto the agent's own audio track.
    Direct(Box<crate::room::AudioTrackPublication>),
    /// Diverted into the avatar bridge.
    Bridge(mpsc::Sender<SynthesizedAudio>),
    /// Nowhere: no avatar and direct output disabled.
    Muted,
}

async fn run_output_router(
    mut route: OutputRoute,
    room: Arc<dyn Room>,
    mut synth_rx: mpsc::Receiver<SynthesizedAudio>,
    mut cmd_rx: mpsc::UnboundedReceiver<OutputCommand>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut halted: Option<u64> = None;
    let mut seq: u64 = 0;
    let mut clock = Duration::ZERO;

    loop {
        // Biased select so a halt command always beats the next frame;
        // barge-in must stop publication within a bounded frame count.
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            command = cmd_rx.recv() => {
                match command {
                    Some(OutputCommand::HaltUtterance { utterance_id }) => {
                        halted = Some(utterance_id);
                        let _ = events.send(SessionEvent::Interrupted { utterance_id });
                        let _ = control_tx.send(ControlEvent::UtteranceHalted { utterance_id });
                    }
                    Some(OutputCommand::FallbackDirect) => {
                        if matches!(route, OutputRoute::Bridge(_)) {
                            route = match room
                                .publish_audio_track(TrackOptions {
                                    name: AGENT_AUDIO_TRACK.to_owned(),
                                    participant: room.local_identity(),
                                })
                                .await
                            {
                                Ok(publication) => {
                                    info!("output rerouted to direct room audio");
                                    OutputRoute::Direct(Box::new(publication))
                                }
                                Err(e) => {
                                    error!("direct-audio fallback failed: {e}");
                                    OutputRoute::Muted
                                }
                            };
                        }
                    }
                    None => break,
                }
            }
            chunk = synth_rx.recv() => {
                let Some(chunk) = chunk else { break };
                if halted == Some(chunk.utterance_id) {
                    // Already-published audio is not retracted; the rest of
                    // the utterance is dropped here. The bridge still gets
                    // the end marker so the renderer can ack the utterance.
                    if chunk.is_final && let OutputRoute::Bridge(sink) = &route {
                        let _ = sink.send(chunk).await;
                    }
                    continue;
                }
                if chunk.is_final {
                    let utterance_id = chunk.utterance_id;
                    if let OutputRoute::Bridge(sink) = &route {
                        // The bridge turns the marker into an utterance
                        // boundary for the renderer.
                        let _ = sink.send(chunk).await;
                    }
                    let _ = events.send(SessionEvent::UtterancePublished { utterance_id });
                    let _ = control_tx.send(ControlEvent::UtteranceComplete { utterance_id });
                    continue;
                }
                match &route {
                    OutputRoute::Direct(publication) => {
                        let mut frame = chunk.frame;
                        seq += 1;
                        frame.seq = seq;
                        frame.timestamp = clock;
                        clock += frame.duration();
                        if publication.send(frame).await.is_err() {
                            warn!("agent audio track closed, muting output");
                            route = OutputRoute::Muted;
                        }
                    }
                    OutputRoute::Bridge(sink) => {
                        if sink.send(chunk).await.is_err() {
                            warn!("avatar bridge gone, dropping frame");
                        }
                    }
                    OutputRoute::Muted => {}
                }
            }
        }
    }
}

/// Control task parameters.
struct ControlCtx {
    barge_in: BargeInConfig,
    failure_policy: Option<AvatarFailurePolicy>,
    state_tx: watch::Sender<SessionState>,
    out_cmd_tx: mpsc::UnboundedSender<OutputCommand>,
    interrupt: Arc<AtomicBool>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
}

/// The single writer of the session's turn state.
async fn run_control_task(mut control_rx: mpsc::UnboundedReceiver<ControlEvent>, ctx: ControlCtx) {
    let mut state = SessionState::Idle;
    let mut current_utterance: Option<u64> = None;

    let apply = |state: &mut SessionState, event: &ControlEvent| {
        let next = next_state(*state, event);
        if next != *state {
            let _ = ctx.events.send(SessionEvent::StateChanged {
                from: *state,
                to: next,
            });
            *state = next;
            ctx.state_tx.send_replace(next);
        }
    };

    // Session start: Idle → Listening.
    apply(&mut state, &ControlEvent::ResumeListening);

    loop {
        let event = tokio::select! {
            () = ctx.cancel.cancelled() => break,
            event = control_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match &event {
            ControlEvent::ReplyStarted { utterance_id } => {
                current_utterance = Some(*utterance_id);
            }
            ControlEvent::UserSpeechStart { rms } => {
                if state == SessionState::Responding
                    && ctx.barge_in.enabled
                    && *rms >= ctx.barge_in.min_rms
                    && let Some(utterance_id) = current_utterance
                {
                    info!(utterance_id, "barge-in, interrupting response");
                    ctx.interrupt.store(true, Ordering::Relaxed);
                    let _ = ctx.out_cmd_tx.send(OutputCommand::HaltUtterance { utterance_id });
                } else {
                    // Below the barge-in threshold (or disabled): the
                    // response keeps streaming, so no transition either.
                    continue;
                }
            }
            ControlEvent::AvatarFailed { reason } => match ctx.failure_policy {
                Some(AvatarFailurePolicy::DirectAudio) => {
                    warn!(%reason, "avatar failed mid-session, dropping embodiment");
                    let _ = ctx.events.send(SessionEvent::AvatarFallback {
                        reason: reason.clone(),
                    });
                    let _ = ctx.out_cmd_tx.send(OutputCommand::FallbackDirect);
                }
                Some(AvatarFailurePolicy::FailSession) => {
                    error!(%reason, "avatar failed mid-session, ending session");
                    ctx.cancel.cancel();
                    break;
                }
                None => {}
            },
            _ => {}
        }

        apply(&mut state, &event);

        // Idle is transient while the session lives: resume listening.
        if state == SessionState::Idle {
            apply(&mut state, &ControlEvent::ResumeListening);
        }
    }

    // Terminal transition, observable by anyone holding the watch.
    let _ = ctx.events.send(SessionEvent::StateChanged {
        from: state,
        to: SessionState::Ended,
    });
    ctx.state_tx.send_replace(SessionState::Ended);
}
