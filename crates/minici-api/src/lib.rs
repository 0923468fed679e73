//! API server for minici.
//!
//! Provides the HTTP REST API for build control and a WebSocket endpoint
//! for live build output.

pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use state::AppState;
