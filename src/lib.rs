//! houkokusou: consultation intake, analysis and recipient routing.

pub mod api;
pub mod config;
pub mod error;
pub mod llm;
pub mod store;
pub mod workflow;
