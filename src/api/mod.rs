pub mod client;
pub mod error;
pub mod types;

pub use client::{ApiResponse, AuthenticatedClient, ClientConfig, RequestOptions};
pub use error::ClientError;
pub use types::{WorkflowKind, WorkflowPayload, WorkflowResponse};
