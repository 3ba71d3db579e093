//! Status polling for sessions the server is still working on.
//!
//! [`WorkflowPoller::attach`] spawns one background task per session. The
//! task sleeps, reads `/workflow/{kind}/status/{id}`, applies the answer to
//! the session and stops as soon as the session leaves `Processing`.
//! Transient failures (network, 5xx) back off exponentially up to
//! `max_interval`; anything else stops the poll at once. An expired login
//! stops the poll without touching the session.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::{SessionSnapshot, WeakSession, WorkflowSession};
use super::state::SessionState;
use crate::api::{ClientError, RequestOptions};
use crate::error::CprError;

/// Polling schedule.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay between reads while the backend is healthy.
    pub interval: Duration,
    /// Backoff cap.
    pub max_interval: Duration,
    /// Consecutive transient failures tolerated before giving up.
    pub max_consecutive_failures: u32,
    /// Overall wall-clock budget for one poll.
    pub max_duration: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2000),
            max_interval: Duration::from_millis(16_000),
            max_consecutive_failures: 5,
            max_duration: Duration::from_secs(600),
        }
    }
}

impl PollerConfig {
    /// Delay after `failures` consecutive transient failures:
    /// `interval * 2^failures`, capped at `max_interval`.
    pub fn delay_after_failures(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures);
        self.interval
            .checked_mul(factor)
            .map_or(self.max_interval, |d| d.min(self.max_interval))
    }
}

/// How a poll ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The server finished; the snapshot carries the final payload.
    Completed(SessionSnapshot),
    /// The workflow needs user input again.
    WaitingInput(SessionSnapshot),
    /// Unrecoverable error, either reported by the workflow or by the client.
    Failed { message: String },
    /// Too many consecutive failures, or the overall budget ran out.
    TimedOut { attempts: u32 },
    /// The credential could not be refreshed. The session is left
    /// `Processing` so it can be polled again after a new login.
    AuthExpired,
    Cancelled,
}

impl PollOutcome {
    /// Converts the outcome into the snapshot the caller waits for.
    pub fn into_result(self) -> Result<SessionSnapshot, CprError> {
        match self {
            PollOutcome::Completed(snap) | PollOutcome::WaitingInput(snap) => Ok(snap),
            PollOutcome::Failed { message } => Err(CprError::WorkflowFailed(message)),
            PollOutcome::TimedOut { attempts } => Err(CprError::PollTimeout { attempts }),
            PollOutcome::AuthExpired => Err(CprError::Client(ClientError::AuthExpired)),
            PollOutcome::Cancelled => Err(CprError::Abandoned),
        }
    }
}

/// Handle to a running poll.
///
/// `cancel` is idempotent and stops the task before its next tick; an
/// in-flight status read is aborted rather than applied.
#[derive(Debug, Clone)]
pub struct PollHandle {
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<PollOutcome>>,
}

impl PollHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && self.outcome.borrow().is_none()
    }

    /// Waits for the poll to end.
    pub async fn wait(&self) -> PollOutcome {
        let mut rx = self.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            // Task gone without reporting: it was torn down with the runtime.
            Err(_) => None,
        };
        outcome.unwrap_or(PollOutcome::Cancelled)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowPoller {
    config: PollerConfig,
}

impl WorkflowPoller {
    pub fn new(config: PollerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Starts polling `session`, or returns the poll already running for it.
    ///
    /// The session must be `Processing`. Must be called inside a Tokio runtime.
    pub fn attach(&self, session: &WorkflowSession) -> Result<PollHandle, CprError> {
        let mut slot = session.poll_slot();
        if let Some(active) = slot.as_ref()
            && active.is_active()
        {
            debug!(session_id = ?session.session_id(), "poller already attached");
            return Ok(active.clone());
        }
        if session.is_abandoned() {
            return Err(CprError::Abandoned);
        }
        let state = session.state();
        if state != SessionState::Processing || session.session_id().is_none() {
            return Err(CprError::InvalidState {
                operation: "poll",
                state,
            });
        }

        let cancel = session.cancel_token().child_token();
        let (tx, rx) = watch::channel(None);
        let handle = PollHandle {
            cancel: cancel.clone(),
            outcome: rx,
        };
        info!(session_id = ?session.session_id(), "attaching status poller");
        tokio::spawn(run(session.downgrade(), self.config.clone(), cancel, tx));
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Attaches and waits for the terminal snapshot.
    pub async fn poll_until_done(&self, session: &WorkflowSession) -> Result<SessionSnapshot, CprError> {
        self.attach(session)?.wait().await.into_result()
    }
}

async fn run(
    session: WeakSession,
    config: PollerConfig,
    cancel: CancellationToken,
    tx: watch::Sender<Option<PollOutcome>>,
) {
    let outcome = poll_loop(&session, &config, &cancel).await;
    debug!(?outcome, "poller finished");
    tx.send_replace(Some(outcome));
}

async fn poll_loop(
    weak: &WeakSession,
    config: &PollerConfig,
    cancel: &CancellationToken,
) -> PollOutcome {
    let deadline = Instant::now() + config.max_duration;
    let mut delay = config.interval;
    let mut failures = 0u32;
    let mut attempts = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = sleep(delay) => {}
        }
        // Dropping every session handle counts as abandoning the session.
        let Some(session) = weak.upgrade() else {
            return PollOutcome::Cancelled;
        };
        if Instant::now() >= deadline {
            let snap = session.fail(CprError::PollTimeout { attempts }.to_string());
            debug!(state = %snap.state, "poll budget exhausted");
            return PollOutcome::TimedOut { attempts };
        }

        attempts += 1;
        let opts = RequestOptions::with_cancel(cancel.clone());
        match session.poll_status(&opts).await {
            Ok(snap) => {
                if cancel.is_cancelled() {
                    return PollOutcome::Cancelled;
                }
                failures = 0;
                delay = config.interval;
                debug!(attempt = attempts, state = %snap.state, step = ?snap.current_step, "poll tick");
                match snap.state {
                    SessionState::Completed => return PollOutcome::Completed(snap),
                    SessionState::WaitingInput => return PollOutcome::WaitingInput(snap),
                    SessionState::Failed => {
                        return PollOutcome::Failed {
                            message: snap
                                .last_error
                                .unwrap_or_else(|| "workflow failed".to_string()),
                        };
                    }
                    _ => {}
                }
            }
            Err(ClientError::Cancelled) => return PollOutcome::Cancelled,
            Err(ClientError::AuthExpired) => {
                warn!(attempt = attempts, "credential expired while polling");
                return PollOutcome::AuthExpired;
            }
            Err(e) if e.is_retryable() => {
                failures += 1;
                if failures >= config.max_consecutive_failures {
                    warn!(failures, error = %e, "giving up on status polling");
                    session.fail(CprError::PollTimeout { attempts }.to_string());
                    return PollOutcome::TimedOut { attempts };
                }
                delay = config.delay_after_failures(failures);
                warn!(failures, error = %e, next_in_ms = delay.as_millis() as u64, "status poll failed, backing off");
            }
            Err(e) => {
                let message = e.to_string();
                session.fail(message.clone());
                return PollOutcome::Failed { message };
            }
        }
    }
}
