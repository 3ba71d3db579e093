//! Client-side session and workflow core for the CPR backend.
//!
//! - [`auth`]: credential pair and its storage.
//! - [`api`]: [`AuthenticatedClient`](api::AuthenticatedClient) with
//!   single-flight token refresh.
//! - [`workflow`]: resumable workflow sessions and status polling.
//! - [`draft`]: server-side drafts with a terminal submit.

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod draft;
pub mod error;
pub mod orchestrator;
pub mod ui;
pub mod workflow;

pub use error::CprError;
