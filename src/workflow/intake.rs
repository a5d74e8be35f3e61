//! Accepts a consultation and starts its workflow.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::error::WorkflowError;
use crate::store::Database;
use crate::workflow::engine::WorkflowEngine;
use crate::workflow::types::{
    Conversation, ConversationStatus, MessageContext, ReportedStatus, UserInfo,
};

/// A consultation as submitted by a caller.
#[derive(Debug, Clone)]
pub struct Submission {
    pub message: String,
    pub context: MessageContext,
    pub user: UserInfo,
    pub connection_id: Option<String>,
}

/// Acknowledgement returned as soon as the workflow is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub conversation_id: String,
    pub status: ReportedStatus,
    pub execution_id: String,
}

pub struct IntakeHandler {
    db: Arc<dyn Database>,
    engine: Arc<WorkflowEngine>,
    config: WorkflowConfig,
}

impl IntakeHandler {
    pub fn new(db: Arc<dyn Database>, engine: Arc<WorkflowEngine>, config: WorkflowConfig) -> Self {
        Self { db, engine, config }
    }

    /// Validate, record and start. Every call creates a new conversation.
    pub async fn submit(&self, submission: Submission) -> Result<Accepted, WorkflowError> {
        let message = self.validate(&submission.message)?;

        let conversation = Conversation::new(
            Uuid::new_v4().to_string(),
            submission.user,
            message,
            submission.context,
            submission.connection_id,
            self.config.conversation_ttl,
        );
        self.db.insert_conversation(&conversation).await?;

        let conversation_id = conversation.id.clone();
        let user_id = conversation.user.user_id.clone();
        let started = match self.engine.start(conversation).await {
            Ok(started) => started,
            Err(e) => {
                self.abandon(&conversation_id, &e.to_string()).await;
                return Err(e);
            }
        };

        info!(
            conversation_id = %conversation_id,
            execution_id = %started.execution_id,
            user_id = %user_id,
            "Consultation accepted"
        );

        Ok(Accepted {
            conversation_id,
            status: ReportedStatus::Processing,
            execution_id: started.execution_id,
        })
    }

    /// Close out a conversation whose instance never started, so it does
    /// not sit in `initialized` forever.
    async fn abandon(&self, conversation_id: &str, message: &str) {
        let closed = match self
            .db
            .transition_conversation(conversation_id, ConversationStatus::Processing, None)
            .await
        {
            Ok(_) => {
                self.db
                    .transition_conversation(conversation_id, ConversationStatus::Error, Some(message))
                    .await
            }
            Err(e) => Err(e),
        };
        match closed {
            Ok(true) => warn!(conversation_id, error = message, "Workflow could not start"),
            Ok(false) => warn!(conversation_id, "Unstarted conversation was not in a closable state"),
            Err(e) => error!(conversation_id, error = %e, "Failed to close unstarted conversation"),
        }
    }

    fn validate<'a>(&self, message: &'a str) -> Result<&'a str, WorkflowError> {
        let trimmed = message.trim();
        if trimmed.is_empty() {
            return Err(WorkflowError::Validation("message is required".to_string()));
        }
        let chars = trimmed.chars().count();
        if chars > self.config.max_message_chars {
            return Err(WorkflowError::Validation(format!(
                "message is too long ({chars} characters, limit {})",
                self.config.max_message_chars
            )));
        }
        Ok(trimmed)
    }
}
