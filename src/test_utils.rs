//! Shared test doubles for the stage and room contracts.
//!
//! Scripted implementations are deterministic, so the crate's tests never
//! depend on live vendors: a [`LocalRoom`] records published frames, and
//! the scripted STT/reasoner/synthesizer/renderer replay canned behavior.

use crate::avatar::{
    AvatarHandshake, AvatarRenderer, RendererInput, RendererOutput, RendererSession,
};
use crate::error::{AgentError, Result};
use crate::llm::{
    FinishReason, LlmEvent, LlmEventStream, Message, ReasoningEngine, ToolDefinition,
};
use crate::pipeline::messages::{AudioFrame, SttEvent, VideoFrame};
use crate::room::{
    AudioTrackPublication, ParticipantIdentity, Room, RoomConnector, RoomRef, TrackOptions,
    VideoTrackPublication,
};
use crate::stt::{SpeechToText, SttSession};
use crate::tts::SpeechSynthesizer;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const TRACK_CHANNEL_SIZE: usize = 64;

/// Install a test subscriber once; later calls are no-ops. Honors
/// `RUST_LOG` so a failing pipeline test can be rerun with stage logs.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── audio fixtures ───────────────────────────────────────────────────

/// A frame of constant-amplitude "speech" (or silence at 0.0).
pub fn audio_frame(seq: u64, amplitude: f32, millis: u64) -> AudioFrame {
    let sample_rate = 16_000;
    let samples = vec![amplitude; (sample_rate as u64 * millis / 1000) as usize];
    AudioFrame {
        samples,
        sample_rate,
        seq,
        timestamp: Duration::from_millis(seq * millis),
    }
}

// ── in-memory room ───────────────────────────────────────────────────

struct TrackRecord<T> {
    frames: Mutex<Vec<T>>,
    published: AtomicBool,
}

impl<T> TrackRecord<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            published: AtomicBool::new(true),
        })
    }
}

/// In-memory [`Room`] recording everything the agent publishes.
pub struct LocalRoom {
    identity: ParticipantIdentity,
    attributes: Mutex<HashMap<String, String>>,
    audio_tracks: Mutex<HashMap<(String, String), Arc<TrackRecord<AudioFrame>>>>,
    video_tracks: Mutex<HashMap<(String, String), Arc<TrackRecord<VideoFrame>>>>,
    remote_audio_tx: Mutex<Option<mpsc::Sender<AudioFrame>>>,
    disconnected: AtomicBool,
}

impl LocalRoom {
    /// Empty room with the given local identity.
    pub fn new(identity: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            identity: ParticipantIdentity::new(identity),
            attributes: Mutex::new(HashMap::new()),
            audio_tracks: Mutex::new(HashMap::new()),
            video_tracks: Mutex::new(HashMap::new()),
            remote_audio_tx: Mutex::new(None),
            disconnected: AtomicBool::new(false),
        })
    }

    /// Feed one frame of remote-participant audio into the session.
    pub async fn push_remote_audio(&self, frame: AudioFrame) {
        let tx = self.remote_audio_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(frame).await;
        }
    }

    /// Drop the remote audio feed (simulates the room going away).
    pub fn close_remote_audio(&self) {
        self.remote_audio_tx.lock().unwrap().take();
    }

    /// Number of audio frames published on a track.
    pub fn audio_frame_count(&self, participant: &str, track: &str) -> usize {
        self.audio_tracks
            .lock()
            .unwrap()
            .get(&(participant.to_owned(), track.to_owned()))
            .map_or(0, |record| record.frames.lock().unwrap().len())
    }

    /// Number of video frames published on a track.
    pub fn video_frame_count(&self, participant: &str, track: &str) -> usize {
        self.video_tracks
            .lock()
            .unwrap()
            .get(&(participant.to_owned(), track.to_owned()))
            .map_or(0, |record| record.frames.lock().unwrap().len())
    }

    /// Whether an audio track was ever published.
    pub fn has_audio_track(&self, participant: &str, track: &str) -> bool {
        self.audio_tracks
            .lock()
            .unwrap()
            .contains_key(&(participant.to_owned(), track.to_owned()))
    }

    /// Whether an audio track is currently published (guard not dropped).
    pub fn is_audio_published(&self, participant: &str, track: &str) -> bool {
        self.audio_tracks
            .lock()
            .unwrap()
            .get(&(participant.to_owned(), track.to_owned()))
            .is_some_and(|record| record.published.load(Ordering::SeqCst))
    }

    /// Presence metadata applied to the local participant.
    pub fn local_attributes(&self) -> HashMap<String, String> {
        self.attributes.lock().unwrap().clone()
    }

    /// Whether `disconnect` was called.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Room for LocalRoom {
    fn local_identity(&self) -> ParticipantIdentity {
        self.identity.clone()
    }

    async fn publish_audio_track(&self, options: TrackOptions) -> Result<AudioTrackPublication> {
        let key = (options.participant.to_string(), options.name.clone());
        let record = TrackRecord::<AudioFrame>::new();
        self.audio_tracks
            .lock()
            .unwrap()
            .insert(key, Arc::clone(&record));

        let (tx, mut rx) = mpsc::channel::<AudioFrame>(TRACK_CHANNEL_SIZE);
        let collector = Arc::clone(&record);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                collector.frames.lock().unwrap().push(frame);
            }
        });

        let published = Arc::clone(&record);
        Ok(AudioTrackPublication::new(
            options,
            tx,
            Box::new(move || published.published.store(false, Ordering::SeqCst)),
        ))
    }

    async fn publish_video_track(&self, options: TrackOptions) -> Result<VideoTrackPublication> {
        let key = (options.participant.to_string(), options.name.clone());
        let record = TrackRecord::<VideoFrame>::new();
        self.video_tracks
            .lock()
            .unwrap()
            .insert(key, Arc::clone(&record));

        let (tx, mut rx) = mpsc::channel::<VideoFrame>(TRACK_CHANNEL_SIZE);
        let collector = Arc::clone(&record);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                collector.frames.lock().unwrap().push(frame);
            }
        });

        let published = Arc::clone(&record);
        Ok(VideoTrackPublication::new(
            options,
            tx,
            Box::new(move || published.published.store(false, Ordering::SeqCst)),
        ))
    }

    async fn subscribe_audio(&self) -> Result<mpsc::Receiver<AudioFrame>> {
        let (tx, rx) = mpsc::channel(TRACK_CHANNEL_SIZE);
        *self.remote_audio_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn set_local_attributes(&self, attributes: HashMap<String, String>) -> Result<()> {
        self.attributes.lock().unwrap().extend(attributes);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        self.close_remote_audio();
        Ok(())
    }
}

/// Connector resolving room references to pre-registered [`LocalRoom`]s.
#[derive(Default)]
pub struct LocalRoomConnector {
    rooms: Mutex<HashMap<String, Arc<LocalRoom>>>,
    fail_connect: AtomicBool,
}

impl LocalRoomConnector {
    /// Empty connector; unknown rooms are created on demand.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a room so tests can keep a handle to it.
    pub fn insert(&self, room_ref: &RoomRef, room: Arc<LocalRoom>) {
        self.rooms.lock().unwrap().insert(room_ref.0.clone(), room);
    }

    /// Make every subsequent connect fail with a connection error.
    pub fn fail_connections(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RoomConnector for LocalRoomConnector {
    async fn connect(
        &self,
        room: &RoomRef,
        identity: &ParticipantIdentity,
        _timeout: Duration,
    ) -> Result<Arc<dyn Room>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(AgentError::Connection("auth rejected".to_owned()));
        }
        let room = self
            .rooms
            .lock()
            .unwrap()
            .entry(room.0.clone())
            .or_insert_with(|| LocalRoom::new(identity.to_string()))
            .clone();
        Ok(room)
    }
}

// ── scripted vendor stages ───────────────────────────────────────────

/// STT fake: replays one batch of events per speech segment fed in.
pub struct ScriptedStt {
    scripts: Arc<Mutex<VecDeque<Vec<SttEvent>>>>,
}

impl ScriptedStt {
    /// One script entry is the event batch for one segment, in order.
    pub fn new(scripts: Vec<Vec<SttEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
        }
    }

    /// Shorthand: each segment yields one final transcript.
    pub fn finals(texts: &[&str]) -> Self {
        Self::new(
            texts
                .iter()
                .map(|t| {
                    vec![SttEvent::Final {
                        text: (*t).to_owned(),
                    }]
                })
                .collect(),
        )
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn start(&self, _sample_rate: u32) -> Result<SttSession> {
        let (session, mut audio_rx, event_tx) = SttSession::channel();
        let scripts = Arc::clone(&self.scripts);
        tokio::spawn(async move {
            while let Some(_segment) = audio_rx.recv().await {
                let batch = scripts.lock().unwrap().pop_front();
                let Some(batch) = batch else { continue };
                for event in batch {
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(session)
    }
}

/// Reasoner fake: replays scripted event rounds in FIFO order.
pub struct ScriptedReasoner {
    rounds: Mutex<VecDeque<Vec<LlmEvent>>>,
}

impl ScriptedReasoner {
    /// Raw rounds, consumed front to back (one per `respond` call).
    pub fn new(rounds: Vec<Vec<LlmEvent>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
        }
    }

    /// Shorthand: each entry is one plain text reply.
    pub fn replies(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Self::text_round(t)).collect())
    }

    /// Event round for a plain text reply.
    pub fn text_round(text: &str) -> Vec<LlmEvent> {
        vec![
            LlmEvent::TextDelta {
                text: text.to_owned(),
            },
            LlmEvent::StreamEnd {
                finish_reason: FinishReason::Stop,
            },
        ]
    }

    /// Event round requesting one tool call.
    pub fn tool_round(call_id: &str, name: &str, args: &str) -> Vec<LlmEvent> {
        vec![
            LlmEvent::ToolCallStart {
                call_id: call_id.to_owned(),
                name: name.to_owned(),
            },
            LlmEvent::ToolCallArgsDelta {
                call_id: call_id.to_owned(),
                args_fragment: args.to_owned(),
            },
            LlmEvent::ToolCallEnd {
                call_id: call_id.to_owned(),
            },
            LlmEvent::StreamEnd {
                finish_reason: FinishReason::ToolCalls,
            },
        ]
    }
}

#[async_trait]
impl ReasoningEngine for ScriptedReasoner {
    async fn respond(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<LlmEventStream> {
        let round = self.rounds.lock().unwrap().pop_front().unwrap_or_else(|| {
            vec![LlmEvent::StreamEnd {
                finish_reason: FinishReason::Stop,
            }]
        });
        Ok(Box::pin(futures_util::stream::iter(
            round.into_iter().map(Ok),
        )))
    }
}

/// Synthesizer fake: constant-amplitude frames per sentence.
pub struct ScriptedTts {
    /// Frames generated for every sentence.
    pub frames_per_sentence: usize,
    /// Samples per frame.
    pub samples_per_frame: usize,
    /// Pause between frames; lets tests hold a response in flight.
    pub frame_delay_ms: u64,
}

impl Default for ScriptedTts {
    fn default() -> Self {
        Self {
            frames_per_sentence: 3,
            samples_per_frame: 480,
            frame_delay_ms: 0,
        }
    }
}

impl ScriptedTts {
    /// Synthesizer that paces frames out slowly.
    pub fn slow(frames_per_sentence: usize, frame_delay_ms: u64) -> Self {
        Self {
            frames_per_sentence,
            frame_delay_ms,
            ..Self::default()
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedTts {
    async fn synthesize(&self, _text: &str) -> Result<mpsc::Receiver<AudioFrame>> {
        let (tx, rx) = mpsc::channel(self.frames_per_sentence.max(1));
        let frames = self.frames_per_sentence;
        let samples = self.samples_per_frame;
        let delay = Duration::from_millis(self.frame_delay_ms);
        tokio::spawn(async move {
            for seq in 0..frames {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let frame = AudioFrame {
                    samples: vec![0.1; samples],
                    sample_rate: 24_000,
                    seq: seq as u64,
                    timestamp: Duration::from_millis((seq * 20) as u64),
                };
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    fn sample_rate(&self) -> u32 {
        24_000
    }
}

// ── scripted avatar renderer ─────────────────────────────────────────

/// Renderer fake: echoes audio back as "rendered" audio, emits one video
/// frame per utterance, and (optionally) acks utterance ends.
pub struct ScriptedRenderer {
    fail_handshake: bool,
    auto_ack: bool,
    ack_tx: Mutex<Option<mpsc::Sender<RendererOutput>>>,
    audio_frames_received: Arc<Mutex<usize>>,
    utterance_ends: Arc<Mutex<Vec<u64>>>,
}

impl ScriptedRenderer {
    /// Well-behaved renderer: echoes and acks everything.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_handshake: false,
            auto_ack: true,
            ack_tx: Mutex::new(None),
            audio_frames_received: Arc::new(Mutex::new(0)),
            utterance_ends: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Renderer whose handshake always fails.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_handshake: true,
            auto_ack: true,
            ack_tx: Mutex::new(None),
            audio_frames_received: Arc::new(Mutex::new(0)),
            utterance_ends: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Renderer that never acks on its own; tests call [`Self::ack`].
    pub fn withholding_acks() -> Arc<Self> {
        Arc::new(Self {
            fail_handshake: false,
            auto_ack: false,
            ack_tx: Mutex::new(None),
            audio_frames_received: Arc::new(Mutex::new(0)),
            utterance_ends: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Manually acknowledge an utterance.
    pub async fn ack(&self, utterance_id: u64) {
        let tx = self.ack_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(RendererOutput::UtteranceAck { utterance_id }).await;
        }
    }

    /// Synthesized audio frames the renderer has consumed.
    pub fn audio_frames_received(&self) -> usize {
        *self.audio_frames_received.lock().unwrap()
    }

    /// Utterance boundaries the renderer has seen, in order.
    pub fn utterance_ends(&self) -> Vec<u64> {
        self.utterance_ends.lock().unwrap().clone()
    }
}

#[async_trait]
impl AvatarRenderer for ScriptedRenderer {
    async fn start(&self, _handshake: AvatarHandshake) -> Result<RendererSession> {
        if self.fail_handshake {
            return Err(AgentError::AvatarUnavailable(
                "renderer rejected handshake".to_owned(),
            ));
        }
        let (input_tx, mut input_rx) = mpsc::channel::<RendererInput>(32);
        let (output_tx, output_rx) = mpsc::channel::<RendererOutput>(32);
        *self.ack_tx.lock().unwrap() = Some(output_tx.clone());

        let auto_ack = self.auto_ack;
        let audio_frames_received = Arc::clone(&self.audio_frames_received);
        let utterance_ends = Arc::clone(&self.utterance_ends);
        tokio::spawn(async move {
            let mut video_seq = 0_u64;
            while let Some(input) = input_rx.recv().await {
                match input {
                    RendererInput::Audio(frame) => {
                        *audio_frames_received.lock().unwrap() += 1;
                        if output_tx
                            .send(RendererOutput::Audio(frame))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    RendererInput::UtteranceEnd { utterance_id } => {
                        utterance_ends.lock().unwrap().push(utterance_id);
                        video_seq += 1;
                        let video = VideoFrame {
                            data: vec![0u8; 16],
                            width: 512,
                            height: 512,
                            seq: video_seq,
                            timestamp: Duration::from_millis(video_seq * 40),
                        };
                        if output_tx.send(RendererOutput::Video(video)).await.is_err() {
                            return;
                        }
                        if auto_ack
                            && output_tx
                                .send(RendererOutput::UtteranceAck { utterance_id })
                                .await
                                .is_err()
                        {
                            return;
                        }
                    }
                }
            }
            let _ = output_tx
                .send(RendererOutput::Closed {
                    reason: "script finished".to_owned(),
                })
                .await;
        });

        Ok(RendererSession {
            input_tx,
            output_rx,
        })
    }
}
