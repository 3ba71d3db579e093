use thiserror::Error;

use crate::api::ClientError;
use crate::workflow::SessionState;

#[derive(Debug, Error)]
pub enum CprError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("could not confirm completion after {attempts} attempts, check back later")]
    PollTimeout { attempts: u32 },

    #[error("a request for session {0} is already in progress")]
    SessionBusy(String),

    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("session is bound to {expected}, server answered for {got}")]
    SessionMismatch { expected: String, got: String },

    #[error("session was abandoned")]
    Abandoned,

    #[error("workflow failed: {0}")]
    WorkflowFailed(String),

    #[error("draft {0} was already submitted")]
    DraftSubmitted(String),
}

impl CprError {
    /// True when the user has to log in again before anything else works.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, CprError::Client(ClientError::AuthExpired))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_display() {
        let err = CprError::InvalidState {
            operation: "continue",
            state: SessionState::Processing,
        };
        assert_eq!(err.to_string(), "cannot continue while session is PROCESSING");
    }

    #[test]
    fn poll_timeout_is_user_actionable() {
        let err = CprError::PollTimeout { attempts: 5 };
        assert_eq!(
            err.to_string(),
            "could not confirm completion after 5 attempts, check back later"
        );
    }

    #[test]
    fn client_errors_pass_through() {
        let err = CprError::from(ClientError::AuthExpired);
        assert!(err.is_auth_expired());
        assert_eq!(err.to_string(), "session expired, please log in again");
    }
}
