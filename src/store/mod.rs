//! Persistence layer — libSQL-backed storage for conversations, executions,
//! suggestions, connections and the organization directory.

pub mod libsql_backend;
pub mod migrations;
pub mod sweep;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use sweep::spawn_expiry_sweep;
pub use traits::{Database, Directory, PurgeCounts};
