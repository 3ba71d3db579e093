mod conversation;
mod poller;
mod session;
mod state;

pub use conversation::{ConversationEntry, ConversationLog, Role};
pub use poller::{PollHandle, PollOutcome, PollerConfig, WorkflowPoller};
pub use session::{SessionSnapshot, WorkflowSession, fetch_status};
pub use state::{SessionState, Transition};
