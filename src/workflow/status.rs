//! Read-only view of a conversation's progress.

use std::sync::Arc;

use tracing::warn;

use crate::error::WorkflowError;
use crate::store::Database;
use crate::workflow::types::{ConversationStatus, ExecutionStatus, ReportedStatus, StatusReport};

pub struct StatusQuery {
    db: Arc<dyn Database>,
}

impl StatusQuery {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Report the status of a conversation. Unknown ids are `NotFound`.
    pub async fn status(&self, conversation_id: &str) -> Result<StatusReport, WorkflowError> {
        let conversation = self
            .db
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(conversation_id.to_string()))?;

        let mut report = StatusReport {
            conversation_id: conversation.id.clone(),
            status: ReportedStatus::Processing,
            analysis: None,
            category: None,
            recommended_recipient: None,
            error: None,
        };

        let Some(execution_id) = conversation.execution_id.as_deref() else {
            // Failed before an instance was attached.
            if conversation.status == ConversationStatus::Error {
                report.status = ReportedStatus::Error;
                report.error = conversation.error.or_else(|| Some("workflow failed".to_string()));
            }
            return Ok(report);
        };
        let Some(execution) = self.db.get_execution(execution_id).await? else {
            warn!(conversation_id, execution_id, "Execution record missing");
            return Ok(report);
        };

        match execution.status {
            ExecutionStatus::Running => {}
            ExecutionStatus::Succeeded => {
                report.status = ReportedStatus::Completed;
                if let Some(output) = execution.output {
                    report.analysis = Some(output.analysis);
                    report.category = Some(output.category);
                    report.recommended_recipient = Some(output.recommended_recipient);
                }
            }
            ExecutionStatus::Failed | ExecutionStatus::TimedOut => {
                report.status = ReportedStatus::Error;
                report.error = execution
                    .error
                    .or(conversation.error)
                    .or_else(|| Some("workflow failed".to_string()));
            }
        }
        Ok(report)
    }
}
