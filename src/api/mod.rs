//! HTTP and WebSocket surface.

pub mod error;
pub mod routes;
pub mod ws;

pub use error::ApiError;
pub use routes::{AppState, SERVICE_NAME, router};
pub use ws::ConnectionHub;
