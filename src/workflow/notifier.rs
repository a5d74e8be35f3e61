//! Push-notification seam between the workflow and live connections.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::NotifyError;
use crate::workflow::types::{AnalysisResult, ReportedStatus, Suggestion, Urgency};

/// Frame pushed to a client when its conversation completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub conversation_id: String,
    pub analysis: String,
    pub status: ReportedStatus,
    pub category: String,
    pub urgency: Urgency,
    pub recommended_recipient: String,
    pub suggested_actions: Vec<String>,
}

impl PushMessage {
    /// The `analysis` frame for a completed conversation.
    pub fn analysis(
        conversation_id: &str,
        analysis: &AnalysisResult,
        suggestion: &Suggestion,
    ) -> Self {
        Self {
            kind: "analysis",
            conversation_id: conversation_id.to_string(),
            analysis: analysis.analysis.clone(),
            status: ReportedStatus::Completed,
            category: analysis.category.clone(),
            urgency: analysis.urgency,
            recommended_recipient: suggestion.recipient.clone(),
            suggested_actions: analysis.suggested_actions.clone(),
        }
    }
}

/// Delivers push frames to a connection.
///
/// A missing, expired or closed connection is an error; callers decide
/// whether that matters.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn push(&self, connection_id: &str, message: &PushMessage) -> Result<(), NotifyError>;
}
