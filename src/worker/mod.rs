//! Worker and job dispatcher.
//!
//! A worker prewarms the process-wide resources once, then accepts or
//! rejects inbound job requests. Each accepted request becomes one
//! [`JobContext`] running as an independent task: a job's failure is
//! reported and logged, never propagated to sibling jobs or the prewarmed
//! state.

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::room::{ParticipantIdentity, Room, RoomConnector, RoomRef};
use crate::vad::VadModel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Attribute key other participants read to learn the session's embodiment.
const ATTR_AGENT_TYPE: &str = "agentType";

/// Worker event channel capacity.
const WORKER_EVENT_CAPACITY: usize = 64;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub uuid::Uuid);

impl JobId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How the session presents itself to other participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbodimentKind {
    /// Avatar audio/video embodiment.
    Avatar,
    /// Plain synthesized voice.
    Voice,
}

impl EmbodimentKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Avatar => "avatar",
            Self::Voice => "voice",
        }
    }
}

/// Closed, schema-validated attribute set attached on accept and applied to
/// the room participant as presence metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobAttributes {
    /// Embodiment declared to the other participants.
    pub agent_type: EmbodimentKind,
}

impl JobAttributes {
    /// Flatten into the wire mapping.
    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([(ATTR_AGENT_TYPE.to_owned(), self.agent_type.as_str().to_owned())])
    }

    /// Parse and validate a wire mapping. Unknown keys are rejected: the
    /// schema is closed, not an open-ended dictionary.
    ///
    /// # Errors
    ///
    /// Returns a config error on unknown keys or values.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        for key in map.keys() {
            if key != ATTR_AGENT_TYPE {
                return Err(AgentError::Config(format!(
                    "unknown job attribute key: {key}"
                )));
            }
        }
        let agent_type = match map.get(ATTR_AGENT_TYPE).map(String::as_str) {
            Some("avatar") => EmbodimentKind::Avatar,
            Some("voice") | None => EmbodimentKind::Voice,
            Some(other) => {
                return Err(AgentError::Config(format!(
                    "unknown agentType value: {other}"
                )));
            }
        };
        Ok(Self { agent_type })
    }
}

/// Immutable description of an inbound job request.
#[derive(Debug, Clone)]
pub struct JobInfo {
    /// Request id.
    pub id: JobId,
    /// Agent name the dispatch layer routed by.
    pub agent_name: String,
    /// Target room.
    pub room: RoomRef,
    /// Attributes proposed by the requester.
    pub proposed_attributes: HashMap<String, String>,
    /// When the request arrived.
    pub received_at: DateTime<Utc>,
}

/// Disposition reported back to the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDisposition {
    /// The worker took the job, with the attributes it declared.
    Accepted {
        /// Attributes visible to other participants.
        attributes: HashMap<String, String>,
    },
    /// The worker declined.
    Rejected {
        /// Why.
        reason: String,
    },
}

/// An inbound job request awaiting exactly one accept/reject response.
///
/// Both responses consume the request, so a double response is
/// unrepresentable rather than a runtime retry case.
pub struct JobRequest {
    /// Request description.
    pub info: JobInfo,
    responder: oneshot::Sender<JobDisposition>,
}

impl JobRequest {
    /// Pair a request with the channel its disposition is reported on.
    pub fn new(info: JobInfo) -> (Self, oneshot::Receiver<JobDisposition>) {
        let (responder, disposition_rx) = oneshot::channel();
        (Self { info, responder }, disposition_rx)
    }

    /// Accept the job, declaring `attributes` to the room.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the requester is gone; the job is not
    /// started in that case.
    pub fn accept(self, attributes: &JobAttributes) -> Result<JobInfo> {
        self.responder
            .send(JobDisposition::Accepted {
                attributes: attributes.to_map(),
            })
            .map_err(|_| AgentError::Channel("job requester went away".to_owned()))?;
        Ok(self.info)
    }

    /// Reject the job. No side effect beyond the response.
    pub fn reject(self, reason: impl Into<String>) {
        let _ = self.responder.send(JobDisposition::Rejected {
            reason: reason.into(),
        });
    }
}

/// Decision returned by [`JobHandler::on_request`].
#[derive(Debug, Clone)]
pub enum RequestDecision {
    /// Take the job with these attributes.
    Accept {
        /// Attributes to declare.
        attributes: JobAttributes,
    },
    /// Decline.
    Reject {
        /// Why.
        reason: String,
    },
}

/// Application contract: request policy plus the per-job entrypoint.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Evaluate an inbound request.
    async fn on_request(&self, info: &JobInfo) -> RequestDecision;

    /// Run one accepted job to completion.
    ///
    /// # Errors
    ///
    /// Errors are isolated to this job and reported on the worker event
    /// channel.
    async fn entrypoint(&self, ctx: JobContext) -> Result<()>;
}

/// Process-wide resources loaded once by prewarm and shared read-only by
/// every job. Never mutated after construction.
pub struct PrewarmedResources {
    /// Voice activity detection model.
    pub vad: Arc<VadModel>,
}

/// Lifecycle events for observability and tests.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A request was accepted and its job spawned.
    JobAccepted {
        /// The job.
        id: JobId,
    },
    /// A request was rejected.
    JobRejected {
        /// The request.
        id: JobId,
        /// Why.
        reason: String,
    },
    /// A job finished; `error` is set when it failed.
    JobFinished {
        /// The job.
        id: JobId,
        /// Failure description, if any.
        error: Option<String>,
    },
}

/// Everything one job needs: its description, the room connector, and the
/// shared prewarmed state.
pub struct JobContext {
    /// Job description.
    pub info: JobInfo,
    /// Attributes declared at accept time.
    pub attributes: JobAttributes,
    /// Session configuration.
    pub config: AgentConfig,
    /// Shared read-only prewarmed state.
    pub prewarmed: Arc<PrewarmedResources>,
    /// Cancellation scope for this job.
    pub cancel: CancellationToken,
    connector: Arc<dyn RoomConnector>,
}

impl JobContext {
    /// Connect to the job's room and apply the accept attributes as
    /// presence metadata.
    ///
    /// # Errors
    ///
    /// Returns a connection error on handshake timeout or rejected auth.
    pub async fn connect(&self) -> Result<Arc<dyn Room>> {
        let identity = ParticipantIdentity::new(self.config.worker.agent_name.clone());
        let timeout = Duration::from_millis(self.config.worker.connect_timeout_ms);
        let room = self.connector.connect(&self.info.room, &identity, timeout).await?;
        room.set_local_attributes(self.attributes.to_map()).await?;
        Ok(room)
    }
}

/// The worker: prewarmed state plus the dispatch loop.
pub struct Worker<H: JobHandler> {
    config: AgentConfig,
    handler: Arc<H>,
    connector: Arc<dyn RoomConnector>,
    prewarmed: Arc<PrewarmedResources>,
    jobs: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
    events_tx: broadcast::Sender<WorkerEvent>,
    cancel: CancellationToken,
}

impl<H: JobHandler> Worker<H> {
    /// Load the expensive process-wide resources exactly once, before any
    /// job runs.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Prewarm`], which is fatal to the whole worker
    /// process; there is no degraded mode without the prewarmed state.
    pub fn prewarm(
        config: AgentConfig,
        handler: Arc<H>,
        connector: Arc<dyn RoomConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let vad = VadModel::load(&config.vad)
            .map_err(|e| AgentError::Prewarm(format!("failed to load VAD model: {e}")))?;
        info!(agent_name = %config.worker.agent_name, "worker prewarmed");
        let (events_tx, _) = broadcast::channel(WORKER_EVENT_CAPACITY);
        Ok(Self {
            config,
            handler,
            connector,
            prewarmed: Arc::new(PrewarmedResources { vad }),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribe to worker lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events_tx.subscribe()
    }

    /// Shared prewarmed state (read-only).
    pub fn prewarmed(&self) -> Arc<PrewarmedResources> {
        Arc::clone(&self.prewarmed)
    }

    /// Ids of currently running jobs.
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.jobs.lock().expect("job map poisoned").keys().copied().collect()
    }

    /// Cancel one running job (the external stop request path).
    pub fn stop_job(&self, id: JobId) {
        if let Some(token) = self.jobs.lock().expect("job map poisoned").get(&id) {
            info!(job = %id, "stopping job");
            token.cancel();
        }
    }

    /// Stop the dispatch loop and cancel every running job.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Dispatch loop: evaluate each inbound request and spawn accepted
    /// jobs. Returns when the request stream closes or after
    /// [`Worker::shutdown`].
    pub async fn run(&self, mut requests: mpsc::Receiver<JobRequest>) {
        loop {
            let request = tokio::select! {
                () = self.cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            self.dispatch(request).await;
        }
        info!("worker dispatch loop stopped");
    }

    async fn dispatch(&self, request: JobRequest) {
        let id = request.info.id;
        match self.handler.on_request(&request.info).await {
            RequestDecision::Reject { reason } => {
                info!(job = %id, %reason, "job rejected");
                let _ = self.events_tx.send(WorkerEvent::JobRejected {
                    id,
                    reason: reason.clone(),
                });
                request.reject(reason);
            }
            RequestDecision::Accept { attributes } => {
                let info = match request.accept(&attributes) {
                    Ok(info) => info,
                    Err(e) => {
                        warn!(job = %id, "accept response undeliverable: {e}");
                        return;
                    }
                };
                let _ = self.events_tx.send(WorkerEvent::JobAccepted { id });
                self.spawn_job(info, attributes);
            }
        }
    }

    /// Spawn one job as an independent task under its own cancellation
    /// scope.
    fn spawn_job(&self, info: JobInfo, attributes: JobAttributes) {
        let id = info.id;
        let job_cancel = self.cancel.child_token();
        self.jobs
            .lock()
            .expect("job map poisoned")
            .insert(id, job_cancel.clone());

        let ctx = JobContext {
            info,
            attributes,
            config: self.config.clone(),
            prewarmed: Arc::clone(&self.prewarmed),
            cancel: job_cancel,
            connector: Arc::clone(&self.connector),
        };
        let handler = Arc::clone(&self.handler);
        let jobs = Arc::clone(&self.jobs);
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            info!(job = %id, room = %ctx.info.room, "job started");
            let result = handler.entrypoint(ctx).await;
            let error = match result {
                Ok(()) => None,
                Err(e) => {
                    error!(job = %id, "job failed: {e}");
                    Some(e.to_string())
                }
            };
            jobs.lock().expect("job map poisoned").remove(&id);
            let _ = events_tx.send(WorkerEvent::JobFinished { id, error });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_schema_is_closed() {
        let attrs = JobAttributes {
            agent_type: EmbodimentKind::Avatar,
        };
        let map = attrs.to_map();
        assert_eq!(map.get(ATTR_AGENT_TYPE).map(String::as_str), Some("avatar"));
        assert_eq!(JobAttributes::from_map(&map).unwrap(), attrs);

        let mut open = map.clone();
        open.insert("favoriteColor".to_owned(), "green".to_owned());
        assert!(JobAttributes::from_map(&open).is_err());

        let mut bad_value = HashMap::new();
        bad_value.insert(ATTR_AGENT_TYPE.to_owned(), "hologram".to_owned());
        assert!(JobAttributes::from_map(&bad_value).is_err());
    }

    #[test]
    fn job_request_responds_exactly_once() {
        let info = JobInfo {
            id: JobId::new(),
            agent_name: "wisp-agent".into(),
            room: RoomRef("room-1".into()),
            proposed_attributes: HashMap::new(),
            received_at: Utc::now(),
        };
        let (request, mut disposition_rx) = JobRequest::new(info);
        request.reject("not for us");
        // Consuming reject means there is no second response to send; the
        // receiver observes exactly one disposition.
        let disposition = disposition_rx.try_recv().unwrap();
        assert!(matches!(disposition, JobDisposition::Rejected { .. }));
        assert!(disposition_rx.try_recv().is_err());
    }
}
