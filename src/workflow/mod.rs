//! Consultation workflow: intake, analysis, recipient matching, result
//! persistence and push, and status reporting.

pub mod analyzer;
pub mod engine;
pub mod intake;
pub mod matcher;
pub mod notifier;
pub mod status;
pub mod types;

pub use analyzer::Analyzer;
pub use engine::{StartedExecution, WorkflowEngine};
pub use intake::{Accepted, IntakeHandler, Submission};
pub use matcher::RecipientMatcher;
pub use notifier::{Notifier, PushMessage};
pub use status::StatusQuery;
