use std::fmt;

use serde::{Deserialize, Serialize};

use crate::api::WorkflowResponse;

/// Step names the backend uses for a workflow that has nothing left to do.
const TERMINAL_STEPS: &[&str] = &["completed", "concluido", "finalizado"];

/// Lifecycle of a workflow session.
///
/// `Idle → Starting → WaitingInput ⇄ Processing → Completed | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Starting,
    WaitingInput,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Starting => write!(f, "STARTING"),
            SessionState::WaitingInput => write!(f, "WAITING_INPUT"),
            SessionState::Processing => write!(f, "PROCESSING"),
            SessionState::Completed => write!(f, "COMPLETED"),
            SessionState::Failed => write!(f, "FAILED"),
        }
    }
}

impl SessionState {
    /// State a session moves to after the server answered with `resp`.
    ///
    /// - a workflow-level `error` fails the session;
    /// - `is_waiting_input` hands control back to the user;
    /// - a generated document or a terminal step completes it;
    /// - anything else is still running on the server.
    pub fn after_response(resp: &WorkflowResponse) -> SessionState {
        if resp.server_error().is_some() {
            SessionState::Failed
        } else if resp.is_waiting_input {
            SessionState::WaitingInput
        } else if resp.document_ready()
            || resp.payload.document_url.is_some()
            || resp
                .current_step
                .as_deref()
                .is_some_and(|step| TERMINAL_STEPS.contains(&step))
        {
            SessionState::Completed
        } else {
            SessionState::Processing
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    /// Whether `start` may be called: fresh sessions, and sessions waiting
    /// for input (resume). Terminal sessions stay terminal.
    pub fn can_start(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::WaitingInput)
    }

    pub fn can_continue(self) -> bool {
        self == SessionState::WaitingInput
    }
}

/// A recorded state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::WorkflowPayload;

    fn response(waiting: bool) -> WorkflowResponse {
        WorkflowResponse {
            session_id: "abc123".into(),
            is_waiting_input: waiting,
            ..Default::default()
        }
    }

    #[test]
    fn waiting_input_hands_back_control() {
        let resp = response(true);
        assert_eq!(SessionState::after_response(&resp), SessionState::WaitingInput);
    }

    #[test]
    fn no_input_and_no_result_is_processing() {
        let mut resp = response(false);
        resp.current_step = Some("generating_report".into());
        assert_eq!(SessionState::after_response(&resp), SessionState::Processing);
    }

    #[test]
    fn generated_document_completes() {
        let mut resp = response(false);
        resp.documento_gerado = Some(true);
        assert_eq!(SessionState::after_response(&resp), SessionState::Completed);

        let mut resp = response(false);
        resp.payload = WorkflowPayload {
            document_url: Some("https://files.example/abc123.pdf".into()),
            ..Default::default()
        };
        assert_eq!(SessionState::after_response(&resp), SessionState::Completed);
    }

    #[test]
    fn terminal_step_completes() {
        let mut resp = response(false);
        resp.current_step = Some("concluido".into());
        assert_eq!(SessionState::after_response(&resp), SessionState::Completed);
    }

    #[test]
    fn server_error_wins_over_everything() {
        let mut resp = response(true);
        resp.error = Some("documento ilegível".into());
        assert_eq!(SessionState::after_response(&resp), SessionState::Failed);

        // Blank error strings are ignored.
        resp.error = Some("  ".into());
        assert_eq!(SessionState::after_response(&resp), SessionState::WaitingInput);
    }

    #[test]
    fn start_and_continue_guards() {
        assert!(SessionState::Idle.can_start());
        assert!(SessionState::WaitingInput.can_start());
        assert!(!SessionState::Completed.can_start());
        assert!(!SessionState::Failed.can_start());
        assert!(!SessionState::Starting.can_start());
        assert!(!SessionState::Processing.can_start());
        assert!(SessionState::WaitingInput.can_continue());
        assert!(!SessionState::Processing.can_continue());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::WaitingInput.is_terminal());
    }

    #[test]
    fn state_display() {
        assert_eq!(SessionState::WaitingInput.to_string(), "WAITING_INPUT");
        assert_eq!(SessionState::Processing.to_string(), "PROCESSING");
    }
}
