use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conversation::{ConversationEntry, ConversationLog, Role};
use super::poller::PollHandle;
use super::state::{SessionState, Transition};
use crate::api::types::{ContinueRequest, StartRequest};
use crate::api::{
    AuthenticatedClient, ClientError, RequestOptions, WorkflowKind, WorkflowPayload,
    WorkflowResponse,
};
use crate::error::CprError;

/// Point-in-time view of a session, published on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub kind: WorkflowKind,
    pub state: SessionState,
    pub current_step: Option<String>,
    /// Last agent message.
    pub text: String,
    pub payload: WorkflowPayload,
    pub last_error: Option<String>,
}

/// One running instance of a backend workflow.
///
/// The handle is cheap to clone; clones drive the same session. `start` and
/// `continue_with` are single-flight: a second call while one is outstanding
/// is rejected with [`CprError::SessionBusy`] without touching the network.
/// Dropping the last handle cancels any attached poller.
#[derive(Clone)]
pub struct WorkflowSession {
    pub(crate) inner: Arc<SessionInner>,
}

impl std::fmt::Debug for WorkflowSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowSession")
            .field("kind", &self.inner.kind)
            .finish_non_exhaustive()
    }
}

/// Non-owning reference held by background pollers.
#[derive(Clone)]
pub(crate) struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub(crate) fn upgrade(&self) -> Option<WorkflowSession> {
        self.0.upgrade().map(|inner| WorkflowSession { inner })
    }
}

pub(crate) struct SessionInner {
    client: AuthenticatedClient,
    kind: WorkflowKind,
    busy: AtomicBool,
    /// Cancelled on abandon; parent of every request and poller token.
    cancel: CancellationToken,
    core: Mutex<SessionCore>,
    snapshots: watch::Sender<SessionSnapshot>,
    pub(crate) poll: Mutex<Option<PollHandle>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct SessionCore {
    session_id: Option<String>,
    state: SessionState,
    current_step: Option<String>,
    text: String,
    payload: WorkflowPayload,
    last_error: Option<String>,
    history: Vec<Transition>,
    conversation: ConversationLog,
}

impl SessionCore {
    fn new() -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            current_step: None,
            text: String::new(),
            payload: WorkflowPayload::default(),
            last_error: None,
            history: Vec::new(),
            conversation: ConversationLog::new(),
        }
    }

    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            debug!(from = %self.state, to = %to, "session transition");
            self.history.push(Transition {
                from: self.state,
                to,
            });
            self.state = to;
        }
    }

    fn snapshot(&self, kind: WorkflowKind) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            kind,
            state: self.state,
            current_step: self.current_step.clone(),
            text: self.text.clone(),
            payload: self.payload.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Resets the busy flag when the outstanding call finishes or is dropped.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fetches the status of a session without going through a [`WorkflowSession`].
pub async fn fetch_status(
    client: &AuthenticatedClient,
    kind: WorkflowKind,
    session_id: &str,
    opts: &RequestOptions,
) -> Result<WorkflowResponse, ClientError> {
    let path = format!("/workflow/{}/status/{session_id}", kind.path_segment());
    client.get_json(&path, opts).await
}

impl WorkflowSession {
    pub fn new(client: AuthenticatedClient, kind: WorkflowKind) -> Self {
        let core = SessionCore::new();
        let (snapshots, _) = watch::channel(core.snapshot(kind));
        Self {
            inner: Arc::new(SessionInner {
                client,
                kind,
                busy: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                core: Mutex::new(core),
                snapshots,
                poll: Mutex::new(None),
            }),
        }
    }

    pub fn kind(&self) -> WorkflowKind {
        self.inner.kind
    }

    pub fn session_id(&self) -> Option<String> {
        self.core().session_id.clone()
    }

    pub fn state(&self) -> SessionState {
        self.core().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.core().snapshot(self.inner.kind)
    }

    /// Receiver that always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn conversation(&self) -> Vec<ConversationEntry> {
        self.core().conversation.entries().to_vec()
    }

    pub fn history(&self) -> Vec<Transition> {
        self.core().history.clone()
    }

    pub fn client(&self) -> &AuthenticatedClient {
        &self.inner.client
    }

    /// Starts a new workflow, or resumes `existing` on the server.
    ///
    /// A session that already has an id always resumes that id, so calling
    /// `start` again never creates a second workflow on the server.
    pub async fn start(&self, existing: Option<&str>) -> Result<SessionSnapshot, CprError> {
        let _busy = self.acquire()?;
        let (previous, resume_id) = {
            let mut core = self.core();
            if !core.state.can_start() {
                return Err(CprError::InvalidState {
                    operation: "start",
                    state: core.state,
                });
            }
            let resume_id = match (core.session_id.as_deref(), existing) {
                (Some(bound), Some(asked)) if bound != asked => {
                    return Err(CprError::SessionMismatch {
                        expected: bound.to_string(),
                        got: asked.to_string(),
                    });
                }
                (Some(bound), _) => Some(bound.to_string()),
                (None, asked) => asked.map(str::to_string),
            };
            let previous = core.state;
            core.transition(SessionState::Starting);
            self.publish(&core);
            (previous, resume_id)
        };

        info!(kind = %self.inner.kind, resume = ?resume_id, "starting workflow session");
        let path = format!("/workflow/{}/start", self.inner.kind.path_segment());
        let body = StartRequest {
            session_id: resume_id.clone(),
        };
        let result = self
            .inner
            .client
            .send_json::<_, WorkflowResponse>(Method::POST, &path, &body, &self.request_options())
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => return Err(self.record_failure(previous, e.into())),
        };
        if resp.session_id.is_empty() {
            let err = ClientError::Backend {
                status: 200,
                message: "start response carried no session_id".to_string(),
            };
            return Err(self.record_failure(previous, err.into()));
        }
        if let Some(expected) = resume_id
            && expected != resp.session_id
        {
            let err = CprError::SessionMismatch {
                expected,
                got: resp.session_id.clone(),
            };
            return Err(self.record_failure(previous, err));
        }

        Ok(self.apply(resp))
    }

    /// Sends user input for the current step.
    ///
    /// Valid only in `WaitingInput`. Errors leave the session in
    /// `WaitingInput` so the user can try again; nothing is retried here.
    pub async fn continue_with(
        &self,
        message: &str,
        step_data: Option<Value>,
    ) -> Result<SessionSnapshot, CprError> {
        let _busy = self.acquire()?;
        let session_id = {
            let mut core = self.core();
            if !core.state.can_continue() {
                return Err(CprError::InvalidState {
                    operation: "continue",
                    state: core.state,
                });
            }
            let Some(id) = core.session_id.clone() else {
                return Err(CprError::InvalidState {
                    operation: "continue",
                    state: core.state,
                });
            };
            id
        };

        debug!(session_id = %session_id, "continuing workflow");
        let path = format!("/workflow/{}/continue", self.inner.kind.path_segment());
        let body = ContinueRequest {
            session_id: session_id.clone(),
            message: message.to_string(),
            step_data,
        };
        let result = self
            .inner
            .client
            .send_json::<_, WorkflowResponse>(Method::POST, &path, &body, &self.request_options())
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => return Err(self.record_failure(SessionState::WaitingInput, e.into())),
        };
        if !resp.session_id.is_empty() && resp.session_id != session_id {
            let err = CprError::SessionMismatch {
                expected: session_id,
                got: resp.session_id,
            };
            return Err(self.record_failure(SessionState::WaitingInput, err));
        }
        // Logged only once the server has taken the message.
        self.core().conversation.push(Role::User, message);
        Ok(self.apply(resp))
    }

    /// Cancels in-flight requests and any attached poller.
    ///
    /// Safe to call more than once.
    pub fn abandon(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!(session_id = ?self.session_id(), "abandoning session");
        }
        self.inner.cancel.cancel();
        if let Some(handle) = self.poll_slot().take() {
            handle.cancel();
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub(crate) fn poll_slot(&self) -> MutexGuard<'_, Option<PollHandle>> {
        self.inner
            .poll
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One status read for a session in `Processing`, applied wholesale.
    pub(crate) async fn poll_status(
        &self,
        opts: &RequestOptions,
    ) -> Result<SessionSnapshot, ClientError> {
        let Some(session_id) = self.session_id() else {
            return Err(ClientError::Validation {
                status: 0,
                message: "session has no id to poll".to_string(),
            });
        };
        let resp = fetch_status(&self.inner.client, self.inner.kind, &session_id, opts).await?;
        if self.state() != SessionState::Processing {
            // Control moved elsewhere while the read was in flight.
            return Ok(self.snapshot());
        }
        Ok(self.apply(resp))
    }

    /// Marks the session failed, used when polling gives up.
    pub(crate) fn fail(&self, message: String) -> SessionSnapshot {
        let mut core = self.core();
        warn!(session_id = ?core.session_id, error = %message, "session failed");
        core.last_error = Some(message);
        core.transition(SessionState::Failed);
        self.publish(&core);
        core.snapshot(self.inner.kind)
    }

    fn acquire(&self) -> Result<BusyGuard<'_>, CprError> {
        if self.inner.cancel.is_cancelled() {
            return Err(CprError::Abandoned);
        }
        self.inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                CprError::SessionBusy(self.session_id().unwrap_or_else(|| "<new>".to_string()))
            })?;
        Ok(BusyGuard(&self.inner.busy))
    }

    fn request_options(&self) -> RequestOptions {
        RequestOptions::with_cancel(self.inner.cancel.child_token())
    }

    /// Replaces step, text and payload with the server's view.
    fn apply(&self, resp: WorkflowResponse) -> SessionSnapshot {
        let next = SessionState::after_response(&resp);
        let mut core = self.core();
        if core.session_id.is_none() && !resp.session_id.is_empty() {
            core.session_id = Some(resp.session_id.clone());
        }
        core.last_error = resp.server_error().map(str::to_string);
        core.conversation.push(Role::Agent, resp.text.as_str());
        core.current_step = resp.current_step;
        core.text = resp.text;
        core.payload = resp.payload;
        core.transition(next);
        self.publish(&core);
        core.snapshot(self.inner.kind)
    }

    /// Records a failed call and restores the state it started from.
    fn record_failure(&self, restore: SessionState, err: CprError) -> CprError {
        let mut core = self.core();
        warn!(session_id = ?core.session_id, error = %err, "workflow call failed");
        core.last_error = Some(err.to_string());
        core.transition(restore);
        self.publish(&core);
        err
    }

    fn publish(&self, core: &SessionCore) {
        self.inner.snapshots.send_replace(core.snapshot(self.inner.kind));
    }

    fn core(&self) -> MutexGuard<'_, SessionCore> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
