//! sshgate: human approval gate in front of scheduled SSH maintenance runs.
//!
//! Library crate shared by the `sshgate` binary and the integration tests in `tests/`.

pub mod api;
pub mod cli;
pub mod clock;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod notification;
pub mod ssh;
pub mod store;
pub mod workflow;

/// Shared state handed to every HTTP handler.
pub struct AppState {
    pub service: workflow::ApprovalService,
    pub config: config::Config,
}
