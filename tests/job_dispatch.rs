//! Worker dispatch lifecycle: accept/reject, isolation, stop.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use wisp::config::AgentConfig;
use wisp::error::AgentError;
use wisp::room::RoomRef;
use wisp::test_utils::{LocalRoom, LocalRoomConnector, init_test_logging};
use wisp::worker::{
    EmbodimentKind, JobAttributes, JobContext, JobDisposition, JobHandler, JobId, JobInfo,
    JobRequest, RequestDecision, Worker, WorkerEvent,
};

const WAIT: Duration = Duration::from_secs(5);

struct TestHandler {
    entrypoints: AtomicUsize,
}

impl TestHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entrypoints: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl JobHandler for TestHandler {
    async fn on_request(&self, info: &JobInfo) -> RequestDecision {
        if info.room.0 == "reject-me" {
            RequestDecision::Reject {
                reason: "not our room".into(),
            }
        } else {
            RequestDecision::Accept {
                attributes: JobAttributes {
                    agent_type: EmbodimentKind::Avatar,
                },
            }
        }
    }

    async fn entrypoint(&self, ctx: JobContext) -> wisp::Result<()> {
        self.entrypoints.fetch_add(1, Ordering::SeqCst);
        let _room = ctx.connect().await?;
        match ctx.info.room.0.as_str() {
            "fail-room" => Err(AgentError::Llm("reasoning vendor exploded".into())),
            "wait-room" => {
                ctx.cancel.cancelled().await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn request(room: &str) -> (JobRequest, oneshot::Receiver<JobDisposition>) {
    JobRequest::new(JobInfo {
        id: JobId::new(),
        agent_name: "wisp-agent".into(),
        room: RoomRef(room.into()),
        proposed_attributes: HashMap::new(),
        received_at: Utc::now(),
    })
}

struct Fixture {
    worker: Arc<Worker<TestHandler>>,
    handler: Arc<TestHandler>,
    connector: Arc<LocalRoomConnector>,
    request_tx: mpsc::Sender<JobRequest>,
    events: tokio::sync::broadcast::Receiver<WorkerEvent>,
}

fn fixture() -> Fixture {
    init_test_logging();
    let connector = LocalRoomConnector::new();
    let handler = TestHandler::new();
    let worker = Arc::new(
        Worker::prewarm(
            AgentConfig::default(),
            Arc::clone(&handler),
            Arc::clone(&connector) as Arc<dyn wisp::room::RoomConnector>,
        )
        .expect("prewarm"),
    );
    let events = worker.subscribe();
    let (request_tx, request_rx) = mpsc::channel(8);
    let runner = Arc::clone(&worker);
    tokio::spawn(async move { runner.run(request_rx).await });
    Fixture {
        worker,
        handler,
        connector,
        request_tx,
        events,
    }
}

async fn next_finished(
    events: &mut tokio::sync::broadcast::Receiver<WorkerEvent>,
) -> (JobId, Option<String>) {
    tokio::time::timeout(WAIT, async {
        loop {
            if let WorkerEvent::JobFinished { id, error } = events.recv().await.expect("events") {
                return (id, error);
            }
        }
    })
    .await
    .expect("job should finish")
}

#[tokio::test]
async fn accepted_job_runs_exactly_one_entrypoint() {
    let mut fx = fixture();
    let room = LocalRoom::new("wisp-agent");
    fx.connector
        .insert(&RoomRef("room-1".into()), Arc::clone(&room));

    let (req, disposition_rx) = request("room-1");
    fx.request_tx.send(req).await.unwrap();

    let disposition = tokio::time::timeout(WAIT, disposition_rx)
        .await
        .expect("disposition in time")
        .expect("disposition sent");
    match disposition {
        JobDisposition::Accepted { attributes } => {
            assert_eq!(attributes.get("agentType").map(String::as_str), Some("avatar"));
        }
        JobDisposition::Rejected { reason } => panic!("unexpected reject: {reason}"),
    }

    let (_, error) = next_finished(&mut fx.events).await;
    assert_eq!(error, None);
    assert_eq!(fx.handler.entrypoints.load(Ordering::SeqCst), 1);
    // Accept attributes became presence metadata on the room participant.
    assert_eq!(
        room.local_attributes().get("agentType").map(String::as_str),
        Some("avatar")
    );
}

#[tokio::test]
async fn rejected_job_has_no_side_effects() {
    let mut fx = fixture();
    let (req, disposition_rx) = request("reject-me");
    fx.request_tx.send(req).await.unwrap();

    let disposition = tokio::time::timeout(WAIT, disposition_rx)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(disposition, JobDisposition::Rejected { .. }));

    let rejected = tokio::time::timeout(WAIT, async {
        loop {
            if let WorkerEvent::JobRejected { .. } = fx.events.recv().await.unwrap() {
                return true;
            }
        }
    })
    .await
    .unwrap();
    assert!(rejected);
    assert_eq!(fx.handler.entrypoints.load(Ordering::SeqCst), 0);
    assert!(fx.worker.active_jobs().is_empty());
}

#[tokio::test]
async fn job_failure_is_isolated_from_siblings() {
    let mut fx = fixture();

    let (failing, _rx1) = request("fail-room");
    let (healthy, _rx2) = request("room-2");
    fx.request_tx.send(failing).await.unwrap();
    fx.request_tx.send(healthy).await.unwrap();

    let mut failures = 0;
    let mut successes = 0;
    for _ in 0..2 {
        let (_, error) = next_finished(&mut fx.events).await;
        if error.is_some() {
            failures += 1;
        } else {
            successes += 1;
        }
    }
    assert_eq!((failures, successes), (1, 1));

    // The worker keeps dispatching after a job failure.
    let (again, _rx3) = request("room-3");
    fx.request_tx.send(again).await.unwrap();
    let (_, error) = next_finished(&mut fx.events).await;
    assert_eq!(error, None);
    assert_eq!(fx.handler.entrypoints.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn stop_job_cancels_only_that_job() {
    let mut fx = fixture();
    let (req, _disposition_rx) = request("wait-room");
    fx.request_tx.send(req).await.unwrap();

    let id = tokio::time::timeout(WAIT, async {
        loop {
            if let WorkerEvent::JobAccepted { id } = fx.events.recv().await.unwrap() {
                return id;
            }
        }
    })
    .await
    .unwrap();

    // Give the entrypoint a moment to park on its cancellation token.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.worker.active_jobs(), vec![id]);

    fx.worker.stop_job(id);
    let (finished, error) = next_finished(&mut fx.events).await;
    assert_eq!(finished, id);
    assert_eq!(error, None);
    assert!(fx.worker.active_jobs().is_empty());
}

#[tokio::test]
async fn connect_failure_surfaces_as_job_error() {
    let mut fx = fixture();
    fx.connector.fail_connections();

    let (req, _disposition_rx) = request("room-1");
    fx.request_tx.send(req).await.unwrap();

    let (_, error) = next_finished(&mut fx.events).await;
    let error = error.expect("connect failure should fail the job");
    assert!(error.contains("connection error"), "got: {error}");
}
