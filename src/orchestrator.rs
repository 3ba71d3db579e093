use tracing::info;

use crate::api::{AuthenticatedClient, WorkflowKind};
use crate::error::CprError;
use crate::workflow::{SessionSnapshot, SessionState, WorkflowPoller, WorkflowSession};

/// Drives sessions through start → continue → poll → complete.
///
/// Every call that leaves the session in `Processing` waits on the poller
/// until control comes back to the user or the workflow ends.
pub struct WorkflowOrchestrator {
    client: AuthenticatedClient,
    poller: WorkflowPoller,
}

impl WorkflowOrchestrator {
    pub fn new(client: AuthenticatedClient, poller: WorkflowPoller) -> Self {
        Self { client, poller }
    }

    pub fn client(&self) -> &AuthenticatedClient {
        &self.client
    }

    /// Starts (or resumes) a workflow and settles its first answer.
    pub async fn begin(
        &self,
        kind: WorkflowKind,
        existing: Option<&str>,
    ) -> Result<(WorkflowSession, SessionSnapshot), CprError> {
        let session = WorkflowSession::new(self.client.clone(), kind);
        let snap = session.start(existing).await?;
        info!(kind = %kind, session_id = ?snap.session_id, state = %snap.state, "workflow started");
        let snap = self.settle(&session, snap).await?;
        Ok((session, snap))
    }

    /// Sends user input and settles the answer.
    pub async fn send(
        &self,
        session: &WorkflowSession,
        message: &str,
        step_data: Option<serde_json::Value>,
    ) -> Result<SessionSnapshot, CprError> {
        let snap = session.continue_with(message, step_data).await?;
        self.settle(session, snap).await
    }

    async fn settle(
        &self,
        session: &WorkflowSession,
        snap: SessionSnapshot,
    ) -> Result<SessionSnapshot, CprError> {
        match snap.state {
            SessionState::Processing => {
                let done = self.poller.poll_until_done(session).await?;
                if done.state == SessionState::Completed {
                    info!(session_id = ?done.session_id, "workflow completed");
                }
                Ok(done)
            }
            SessionState::Failed => Err(CprError::WorkflowFailed(
                snap.last_error
                    .unwrap_or_else(|| "workflow failed".to_string()),
            )),
            _ => Ok(snap),
        }
    }
}
