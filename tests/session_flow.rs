//! End-to-end session pipeline: round trips, barge-in, tool cap,
//! proactive replies.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wisp::config::AgentConfig;
use wisp::events::SessionEvent;
use wisp::llm::{Tool, ToolDefinition, ToolOutcome, ToolRegistry};
use wisp::pipeline::messages::TranscriptEntry;
use wisp::pipeline::state::SessionState;
use wisp::test_utils::{
    LocalRoom, ScriptedReasoner, ScriptedStt, ScriptedTts, audio_frame, init_test_logging,
};
use wisp::vad::VadModel;
use wisp::{SessionHandle, SessionOrchestrator, SessionStages};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> AgentConfig {
    init_test_logging();
    let mut config = AgentConfig::default();
    config.vad.min_silence_duration_ms = 200;
    config.turn_detection.min_endpoint_delay_ms = 40;
    config.turn_detection.max_endpoint_delay_ms = 120;
    config
}

fn orchestrator(
    config: &AgentConfig,
    room: &Arc<LocalRoom>,
    stt: ScriptedStt,
    llm: ScriptedReasoner,
    tts: ScriptedTts,
    tools: ToolRegistry,
) -> SessionOrchestrator {
    let vad = VadModel::load(&config.vad).expect("vad model");
    SessionOrchestrator::new(
        config.clone(),
        SessionStages {
            stt: Arc::new(stt),
            llm: Arc::new(llm),
            tts: Arc::new(tts),
            tools: Arc::new(tools),
        },
        vad,
        Arc::clone(room) as Arc<dyn wisp::room::Room>,
    )
}

async fn wait_event(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event in time")
}

async fn wait_state(handle: &SessionHandle, want: SessionState) {
    let mut rx = handle.state();
    tokio::time::timeout(WAIT, async {
        loop {
            if *rx.borrow() == want {
                return;
            }
            rx.changed().await.expect("state watch open");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state never reached {want:?}"));
}

/// Speak then fall silent, driving VAD through one full segment.
async fn speak_turn(room: &LocalRoom, amplitude: f32) {
    for seq in 0..3 {
        room.push_remote_audio(audio_frame(seq, amplitude, 100)).await;
    }
    for seq in 3..6 {
        room.push_remote_audio(audio_frame(seq, 0.0, 100)).await;
    }
}

#[tokio::test]
async fn zero_tool_round_trip_yields_one_utterance() {
    let config = fast_config();
    let room = LocalRoom::new("wisp-agent");
    let handle = orchestrator(
        &config,
        &room,
        ScriptedStt::finals(&["What is the weather?"]),
        ScriptedReasoner::replies(&["It is sunny."]),
        ScriptedTts::default(),
        ToolRegistry::new(),
    )
    .start()
    .await
    .expect("session starts");
    let mut events = handle.subscribe();

    wait_state(&handle, SessionState::Listening).await;
    speak_turn(&room, 0.2).await;

    wait_event(&mut events, |e| {
        matches!(e, SessionEvent::UtterancePublished { .. })
    })
    .await;
    wait_state(&handle, SessionState::Listening).await;

    // One utterance: three synthesized frames on the direct track, and no
    // more after settling.
    tokio::time::timeout(WAIT, async {
        while room.audio_frame_count("wisp-agent", "agent-voice") < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("frames published");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(room.audio_frame_count("wisp-agent", "agent-voice"), 3);

    // Transcript: one user turn, one agent reply, zero tool-call events.
    let transcript = handle.transcript();
    assert_eq!(
        transcript,
        vec![
            TranscriptEntry::User {
                text: "What is the weather?".into()
            },
            TranscriptEntry::Agent {
                text: "It is sunny.".into()
            },
        ]
    );

    handle.stop();
}

#[tokio::test]
async fn barge_in_interrupts_and_halts_publication() {
    let config = fast_config();
    let room = LocalRoom::new("wisp-agent");
    // Slow synthesis keeps the response in flight long enough to interrupt.
    let handle = orchestrator(
        &config,
        &room,
        ScriptedStt::finals(&["Tell me a story.", "stop"]),
        ScriptedReasoner::replies(&["Once upon a time there was a fox."]),
        ScriptedTts::slow(200, 10),
        ToolRegistry::new(),
    )
    .start()
    .await
    .unwrap();
    let mut events = handle.subscribe();

    wait_state(&handle, SessionState::Listening).await;
    speak_turn(&room, 0.2).await;
    wait_state(&handle, SessionState::Responding).await;

    // Loud user speech during the response: barge-in.
    for seq in 10..13 {
        room.push_remote_audio(audio_frame(seq, 0.5, 100)).await;
    }
    wait_event(&mut events, |e| matches!(e, SessionEvent::Interrupted { .. })).await;
    wait_state(&handle, SessionState::Listening).await;

    // Publication halts within a bounded number of frames: once halted,
    // the count stops moving.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after_halt = room.audio_frame_count("wisp-agent", "agent-voice");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        room.audio_frame_count("wisp-agent", "agent-voice"),
        after_halt,
        "no further frames after barge-in"
    );

    // The interrupted (partial) reply is still on the transcript.
    let transcript = handle.transcript();
    assert!(
        transcript
            .iter()
            .any(|e| matches!(e, TranscriptEntry::Agent { .. })),
    );

    handle.stop();
}

struct CountingTool {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Tool for CountingTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "lookup".into(),
            description: "look something up".into(),
            parameters: serde_json::json!({"type": "object"}),
        }
    }

    async fn execute(&self, _args: serde_json::Value) -> wisp::Result<ToolOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutcome::ok("found nothing"))
    }
}

#[tokio::test]
async fn tool_step_cap_surfaces_partial_reply_and_session_continues() {
    let mut config = fast_config();
    config.llm.max_tool_steps = 2;

    let calls = Arc::new(AtomicUsize::new(0));
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(CountingTool {
        calls: Arc::clone(&calls),
    }));

    // The reasoner demands tools forever, then (next reply) answers plainly.
    let rounds = vec![
        ScriptedReasoner::tool_round("c1", "lookup", "{}"),
        ScriptedReasoner::tool_round("c2", "lookup", "{}"),
        ScriptedReasoner::tool_round("c3", "lookup", "{}"),
        ScriptedReasoner::text_round("Recovered fine."),
    ];

    let room = LocalRoom::new("wisp-agent");
    let handle = orchestrator(
        &config,
        &room,
        ScriptedStt::finals(&[]),
        ScriptedReasoner::new(rounds),
        ScriptedTts::default(),
        tools,
    )
    .start()
    .await
    .unwrap();
    let mut events = handle.subscribe();

    handle.generate_reply("Research the answer").await.unwrap();

    let event = wait_event(&mut events, |e| {
        matches!(e, SessionEvent::ToolStepCapReached { .. })
    })
    .await;
    assert!(matches!(event, SessionEvent::ToolStepCapReached { max: 2 }));

    // The counter never exceeded the cap.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        handle
            .transcript()
            .iter()
            .filter(|e| matches!(e, TranscriptEntry::ToolCall { .. }))
            .count(),
        2
    );

    // Non-fatal: the session still produces the next reply.
    handle.generate_reply("Say you recovered").await.unwrap();
    wait_event(&mut events, |e| {
        matches!(e, SessionEvent::UtterancePublished { .. })
    })
    .await;
    wait_state(&handle, SessionState::Listening).await;

    handle.stop();
}

#[tokio::test]
async fn generate_reply_speaks_without_user_turn() {
    let config = fast_config();
    let room = LocalRoom::new("wisp-agent");
    let handle = orchestrator(
        &config,
        &room,
        ScriptedStt::finals(&[]),
        ScriptedReasoner::replies(&["Hey, how can I help you today?"]),
        ScriptedTts::default(),
        ToolRegistry::new(),
    )
    .start()
    .await
    .unwrap();
    let mut events = handle.subscribe();

    handle
        .generate_reply("Greet the user warmly")
        .await
        .unwrap();

    wait_event(&mut events, |e| {
        matches!(e, SessionEvent::UtterancePublished { .. })
    })
    .await;

    let transcript = handle.transcript();
    assert_eq!(
        transcript,
        vec![TranscriptEntry::Agent {
            text: "Hey, how can I help you today?".into()
        }],
        "a proactive reply is an agent turn with no user turn"
    );

    handle.stop();
}

#[tokio::test]
async fn ended_state_is_observable_after_stop() {
    let config = fast_config();
    let room = LocalRoom::new("wisp-agent");
    let handle = orchestrator(
        &config,
        &room,
        ScriptedStt::finals(&[]),
        ScriptedReasoner::replies(&[]),
        ScriptedTts::default(),
        ToolRegistry::new(),
    )
    .start()
    .await
    .unwrap();

    wait_state(&handle, SessionState::Listening).await;
    handle.stop();
    wait_state(&handle, SessionState::Ended).await;
}
