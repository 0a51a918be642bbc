//! HTTP API server with SSE support

pub mod server;
pub mod state;

pub use server::{ApiServer, ApiServerConfig};
pub use state::AppState;
