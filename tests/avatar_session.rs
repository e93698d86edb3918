//! Avatar bridge: embodied publication, failure policies, backpressure.

use std::sync::Arc;
use std::time::Duration;
use wisp::config::{AgentConfig, AvatarConfig, AvatarFailurePolicy, AvatarRef};
use wisp::error::AgentError;
use wisp::events::SessionEvent;
use wisp::llm::ToolRegistry;
use wisp::pipeline::state::SessionState;
use wisp::test_utils::{
    LocalRoom, ScriptedReasoner, ScriptedRenderer, ScriptedStt, ScriptedTts, init_test_logging,
};
use wisp::vad::VadModel;
use wisp::{SessionOrchestrator, SessionStages};

const WAIT: Duration = Duration::from_secs(5);

fn avatar_config(policy: AvatarFailurePolicy, max_inflight: usize) -> AgentConfig {
    init_test_logging();
    let mut config = AgentConfig::default();
    config.turn_detection.min_endpoint_delay_ms = 40;
    config.room_output.audio_enabled = false;
    config.avatar = Some(AvatarConfig {
        avatar: AvatarRef::Id {
            id: "b9be11b8".into(),
        },
        display_name: "Michael".into(),
        participant_identity: "avatar-agent".into(),
        on_failure: policy,
        max_inflight_utterances: max_inflight,
        connect_timeout_ms: 2_000,
    });
    config
}

fn orchestrator(
    config: &AgentConfig,
    room: &Arc<LocalRoom>,
    llm: ScriptedReasoner,
    renderer: Arc<ScriptedRenderer>,
) -> SessionOrchestrator {
    let vad = VadModel::load(&config.vad).expect("vad model");
    SessionOrchestrator::new(
        config.clone(),
        SessionStages {
            stt: Arc::new(ScriptedStt::finals(&[])),
            llm: Arc::new(llm),
            tts: Arc::new(ScriptedTts::default()),
            tools: Arc::new(ToolRegistry::new()),
        },
        vad,
        Arc::clone(room) as Arc<dyn wisp::room::Room>,
    )
    .with_avatar_renderer(renderer)
}

async fn poll_until(what: &str, mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn avatar_publishes_the_only_audio_source() {
    let config = avatar_config(AvatarFailurePolicy::FailSession, 2);
    let room = LocalRoom::new("wisp-agent");
    let renderer = ScriptedRenderer::new();
    let handle = orchestrator(
        &config,
        &room,
        ScriptedReasoner::replies(&["Hey, how can I help you today?"]),
        Arc::clone(&renderer),
    )
    .start()
    .await
    .expect("avatar session starts");
    let mut events = handle.subscribe();

    handle
        .generate_reply("Say something similar to 'Hey, how can I help you today?'")
        .await
        .unwrap();

    tokio::time::timeout(WAIT, async {
        loop {
            if let SessionEvent::UtterancePublished { .. } = events.recv().await.unwrap() {
                break;
            }
        }
    })
    .await
    .unwrap();

    // The rendered (lip-synced) stream lands under the avatar's identity.
    poll_until("rendered audio republished", || {
        room.audio_frame_count("avatar-agent", "avatar-voice") == 3
    })
    .await;
    poll_until("rendered video republished", || {
        room.video_frame_count("avatar-agent", "avatar-video") == 1
    })
    .await;
    assert_eq!(renderer.utterance_ends(), vec![1]);

    // Exactly one audio source: zero frames on the direct room track.
    assert!(!room.has_audio_track("wisp-agent", "agent-voice"));
    assert_eq!(room.audio_frame_count("wisp-agent", "agent-voice"), 0);

    handle.stop();
}

#[tokio::test]
async fn strict_policy_fails_the_session_before_listening() {
    let config = avatar_config(AvatarFailurePolicy::FailSession, 2);
    let room = LocalRoom::new("wisp-agent");
    let renderer = ScriptedRenderer::failing();

    let err = orchestrator(
        &config,
        &room,
        ScriptedReasoner::replies(&[]),
        renderer,
    )
    .start()
    .await
    .expect_err("strict policy must fail the start");

    assert!(matches!(err, AgentError::AvatarUnavailable(_)));
    // The pipeline never came up: no tracks, no subscriptions.
    assert!(!room.has_audio_track("avatar-agent", "avatar-voice"));
    assert!(!room.has_audio_track("wisp-agent", "agent-voice"));
}

#[tokio::test]
async fn fallback_policy_continues_with_direct_audio() {
    let config = avatar_config(AvatarFailurePolicy::DirectAudio, 2);
    let room = LocalRoom::new("wisp-agent");
    let renderer = ScriptedRenderer::failing();

    let handle = orchestrator(
        &config,
        &room,
        ScriptedReasoner::replies(&["Plain voice it is."]),
        renderer,
    )
    .start()
    .await
    .expect("fallback keeps the session alive");
    let mut events = handle.subscribe();

    handle.generate_reply("Say anything").await.unwrap();
    tokio::time::timeout(WAIT, async {
        loop {
            if let SessionEvent::UtterancePublished { .. } = events.recv().await.unwrap() {
                break;
            }
        }
    })
    .await
    .unwrap();

    poll_until("direct audio published", || {
        room.audio_frame_count("wisp-agent", "agent-voice") == 3
    })
    .await;
    assert!(!room.has_audio_track("avatar-agent", "avatar-voice"));

    handle.stop();
}

#[tokio::test]
async fn renderer_lag_suspends_further_hand_off() {
    let config = avatar_config(AvatarFailurePolicy::FailSession, 1);
    let room = LocalRoom::new("wisp-agent");
    let renderer = ScriptedRenderer::withholding_acks();
    let handle = orchestrator(
        &config,
        &room,
        ScriptedReasoner::new(vec![
            ScriptedReasoner::text_round("First reply."),
            ScriptedReasoner::text_round("Second reply."),
        ]),
        Arc::clone(&renderer),
    )
    .start()
    .await
    .unwrap();

    handle.generate_reply("first").await.unwrap();
    handle.generate_reply("second").await.unwrap();

    // Utterance one is handed off in full; utterance two must wait for the
    // renderer's acknowledgement.
    poll_until("first utterance handed off", || {
        renderer.utterance_ends() == vec![1]
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(renderer.audio_frames_received(), 3);
    assert_eq!(renderer.utterance_ends(), vec![1]);

    // Acknowledge; the suspended utterance flows.
    renderer.ack(1).await;
    poll_until("second utterance handed off", || {
        renderer.utterance_ends() == vec![1, 2]
    })
    .await;
    assert_eq!(renderer.audio_frames_received(), 6);

    handle.stop();
}

#[tokio::test]
async fn avatar_with_direct_audio_enabled_is_rejected_at_start() {
    let mut config = avatar_config(AvatarFailurePolicy::FailSession, 2);
    config.room_output.audio_enabled = true;

    let room = LocalRoom::new("wisp-agent");
    let err = orchestrator(
        &config,
        &room,
        ScriptedReasoner::replies(&[]),
        ScriptedRenderer::new(),
    )
    .start()
    .await
    .expect_err("two audio sources must not start");
    assert!(matches!(err, AgentError::Config(_)));
}

#[tokio::test]
async fn session_state_reaches_listening_with_avatar() {
    let config = avatar_config(AvatarFailurePolicy::FailSession, 2);
    let room = LocalRoom::new("wisp-agent");
    let handle = orchestrator(
        &config,
        &room,
        ScriptedReasoner::replies(&[]),
        ScriptedRenderer::new(),
    )
    .start()
    .await
    .unwrap();

    let mut state = handle.state();
    tokio::time::timeout(WAIT, async {
        while *state.borrow() != SessionState::Listening {
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("avatar session listens");
    handle.stop();
}
