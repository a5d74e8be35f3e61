//! Workflow engine — runs one instance per conversation.
//!
//! An instance is an independent tokio task:
//!
//! ```text
//! mark processing → analyze → match → (persist ∥ notify) → succeeded
//!        └────────── any failure ──────────┘→ conversation error, execution failed
//! ```
//!
//! `workflow_timeout` bounds everything up to and including persistence.
//! The notify push runs under its own `notify_timeout`, so a slow client
//! never turns a persisted result into a timeout. Retries happen only
//! inside the analysis step.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::error::{NotifyError, WorkflowError};
use crate::store::Database;
use crate::workflow::analyzer::Analyzer;
use crate::workflow::matcher::RecipientMatcher;
use crate::workflow::notifier::{Notifier, PushMessage};
use crate::workflow::types::{
    AnalysisResult, Conversation, ConversationStatus, Execution, ExecutionOutput,
    ExecutionStatus, Suggestion,
};

/// Message recorded when an instance exceeds its time budget.
pub const TIMEOUT_MESSAGE: &str = "workflow timed out";

/// Message recorded on instances that were cut off, e.g. by a restart.
pub const INTERRUPTED_MESSAGE: &str = "workflow interrupted";

/// A started workflow instance.
#[derive(Debug)]
pub struct StartedExecution {
    pub execution_id: String,
    pub handle: JoinHandle<()>,
}

/// Why an instance did not succeed.
enum Failure {
    Error(WorkflowError),
    TimedOut,
}

impl From<WorkflowError> for Failure {
    fn from(e: WorkflowError) -> Self {
        Self::Error(e)
    }
}

/// Starts and runs workflow instances.
pub struct WorkflowEngine {
    db: Arc<dyn Database>,
    analyzer: Analyzer,
    matcher: RecipientMatcher,
    notifier: Arc<dyn Notifier>,
    config: WorkflowConfig,
}

impl WorkflowEngine {
    pub fn new(
        db: Arc<dyn Database>,
        analyzer: Analyzer,
        matcher: RecipientMatcher,
        notifier: Arc<dyn Notifier>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            db,
            analyzer,
            matcher,
            notifier,
            config,
        }
    }

    /// Record a new execution for the conversation and run it in the
    /// background. Returns as soon as the instance is spawned.
    pub async fn start(
        self: &Arc<Self>,
        conversation: Conversation,
    ) -> Result<StartedExecution, WorkflowError> {
        if conversation.status != ConversationStatus::Initialized {
            return Err(WorkflowError::InvalidTransition {
                id: conversation.id,
                from: conversation.status.to_string(),
                to: ConversationStatus::Processing.to_string(),
            });
        }
        let execution = Execution {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation.id.clone(),
            status: ExecutionStatus::Running,
            output: None,
            error: None,
            started_at: Utc::now(),
            stopped_at: None,
        };
        self.db.insert_execution(&execution).await?;
        if let Err(e) = self
            .db
            .set_conversation_execution(&conversation.id, &execution.id)
            .await
        {
            // Never spawned, so nothing else will finish it.
            let message = e.to_string();
            if let Err(e) = self
                .db
                .finish_execution(&execution.id, ExecutionStatus::Failed, None, Some(&message))
                .await
            {
                error!(execution_id = %execution.id, error = %e, "Failed to close unstarted execution");
            }
            return Err(e.into());
        }

        let span = info_span!(
            "workflow",
            conversation_id = %conversation.id,
            execution_id = %execution.id
        );
        let engine = Arc::clone(self);
        let execution_id = execution.id.clone();
        let handle = tokio::spawn(
            async move {
                engine.run_instance(conversation, execution.id).await;
            }
            .instrument(span),
        );

        Ok(StartedExecution {
            execution_id,
            handle,
        })
    }

    /// Run one instance to a terminal state. Never returns an error: every
    /// failure ends up on the conversation and the execution record.
    async fn run_instance(&self, conversation: Conversation, execution_id: String) {
        info!("Workflow started");
        let deadline = Instant::now() + self.config.workflow_timeout;

        match self.execute(&conversation, deadline).await {
            Ok(output) => {
                match self
                    .db
                    .finish_execution(&execution_id, ExecutionStatus::Succeeded, Some(&output), None)
                    .await
                {
                    Ok(_) => info!(recipient = %output.recommended_recipient, "Workflow succeeded"),
                    Err(e) => error!(error = %e, "Failed to record execution success"),
                }
            }
            Err(Failure::Error(e)) => {
                warn!(error = %e, "Workflow failed");
                self.fail(&conversation.id, &execution_id, ExecutionStatus::Failed, &e.to_string())
                    .await;
            }
            Err(Failure::TimedOut) => {
                warn!(
                    timeout_secs = self.config.workflow_timeout.as_secs(),
                    "Workflow timed out"
                );
                self.fail(
                    &conversation.id,
                    &execution_id,
                    ExecutionStatus::TimedOut,
                    TIMEOUT_MESSAGE,
                )
                .await;
            }
        }
    }

    /// The instance body. Errors here take the global error path.
    async fn execute(
        &self,
        conversation: &Conversation,
        deadline: Instant,
    ) -> Result<ExecutionOutput, Failure> {
        let (analysis, suggestion) = tokio::time::timeout_at(deadline, self.prepare(conversation))
            .await
            .map_err(|_| Failure::TimedOut)??;

        let (persisted, notified) = tokio::join!(
            tokio::time::timeout_at(deadline, self.persist(conversation, &suggestion)),
            tokio::time::timeout(
                self.config.notify_timeout,
                self.notify(conversation, &analysis, &suggestion)
            ),
        );

        match notified {
            Ok(Ok(true)) => info!("Result pushed to connection"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => warn!(error = %e, "Push notification failed, result is still available"),
            Err(_) => warn!(
                timeout_secs = self.config.notify_timeout.as_secs(),
                "Push notification timed out, result is still available"
            ),
        }
        persisted.map_err(|_| Failure::TimedOut)??;

        Ok(ExecutionOutput {
            conversation_id: conversation.id.clone(),
            analysis: analysis.analysis,
            category: analysis.category,
            urgency: analysis.urgency,
            recommended_recipient: suggestion.recipient,
            suggested_actions: analysis.suggested_actions,
        })
    }

    /// Mark processing, analyze and pick a recipient.
    async fn prepare(
        &self,
        conversation: &Conversation,
    ) -> Result<(AnalysisResult, Suggestion), WorkflowError> {
        self.transition(&conversation.id, ConversationStatus::Processing)
            .await?;
        let analysis = self.analyzer.analyze(conversation).await?;
        let suggestion = self.matcher.recommend(conversation, &analysis).await?;
        Ok((analysis, suggestion))
    }

    /// Persist branch: store the suggestion, then complete the conversation.
    async fn persist(
        &self,
        conversation: &Conversation,
        suggestion: &Suggestion,
    ) -> Result<(), WorkflowError> {
        self.db
            .insert_suggestion(suggestion, conversation.expires_at)
            .await?;
        self.transition(&conversation.id, ConversationStatus::Completed)
            .await
    }

    /// Notify branch. Returns `Ok(false)` when there is no connection to
    /// push to.
    async fn notify(
        &self,
        conversation: &Conversation,
        analysis: &AnalysisResult,
        suggestion: &Suggestion,
    ) -> Result<bool, NotifyError> {
        let Some(connection_id) = conversation.connection_id.as_deref() else {
            return Ok(false);
        };
        let message = PushMessage::analysis(&conversation.id, analysis, suggestion);
        self.notifier.push(connection_id, &message).await?;
        Ok(true)
    }

    async fn transition(&self, id: &str, next: ConversationStatus) -> Result<(), WorkflowError> {
        if self.db.transition_conversation(id, next, None).await? {
            return Ok(());
        }
        let from = match self.db.get_conversation(id).await? {
            Some(current) => current.status.to_string(),
            None => return Err(WorkflowError::NotFound(id.to_string())),
        };
        Err(WorkflowError::InvalidTransition {
            id: id.to_string(),
            from,
            to: next.to_string(),
        })
    }

    /// Global error path.
    async fn fail(
        &self,
        conversation_id: &str,
        execution_id: &str,
        status: ExecutionStatus,
        message: &str,
    ) {
        match self
            .db
            .transition_conversation(conversation_id, ConversationStatus::Error, Some(message))
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!("Conversation was not processing, status left unchanged"),
            Err(e) => error!(error = %e, "Failed to mark conversation as error"),
        }
        if let Err(e) = self
            .db
            .finish_execution(execution_id, status, None, Some(message))
            .await
        {
            error!(error = %e, "Failed to record execution failure");
        }
    }
}
