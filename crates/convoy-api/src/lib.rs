//! Webhook and liveness server for Convoy.
//!
//! A push to the pipeline's source branch starts a full orchestration run.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
