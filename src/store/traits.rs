//! Storage seams: one trait for workflow records, one for the directory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::workflow::types::{
    AnalysisResult, Connection, Conversation, ConversationStatus, Execution, ExecutionOutput,
    ExecutionStatus, HistoryTurn, OrgUnit, Suggestion,
};

/// Counts of rows removed by an expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    pub conversations: usize,
    pub suggestions: usize,
    pub executions: usize,
    pub connections: usize,
}

impl PurgeCounts {
    pub fn total(&self) -> usize {
        self.conversations + self.suggestions + self.executions + self.connections
    }
}

/// Backend-agnostic store for conversations, executions, suggestions and
/// connections.
#[async_trait]
pub trait Database: Send + Sync {
    /// Create the schema and apply pending migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Insert a new conversation record.
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError>;

    /// Get a conversation by ID.
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, DatabaseError>;

    /// Move a conversation to `next`, only if its current status is a legal
    /// predecessor. Returns whether the row changed.
    async fn transition_conversation(
        &self,
        id: &str,
        next: ConversationStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Record the analysis result and bump `updated_at`.
    async fn set_conversation_analysis(
        &self,
        id: &str,
        analysis: &AnalysisResult,
    ) -> Result<(), DatabaseError>;

    /// Record which workflow instance serves this conversation.
    async fn set_conversation_execution(
        &self,
        id: &str,
        execution_id: &str,
    ) -> Result<(), DatabaseError>;

    /// The caller's most recent prior turns, oldest first, excluding one
    /// conversation (usually the current one).
    async fn recent_history(
        &self,
        user_id: &str,
        exclude_conversation: &str,
        limit: usize,
    ) -> Result<Vec<HistoryTurn>, DatabaseError>;

    // ── Executions ──────────────────────────────────────────────────

    /// Insert a new execution in `Running` state.
    async fn insert_execution(&self, execution: &Execution) -> Result<(), DatabaseError>;

    /// Get an execution by ID.
    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, DatabaseError>;

    /// Finish a running execution. A finished execution is never rewritten.
    async fn finish_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        output: Option<&ExecutionOutput>,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    // ── Suggestions ─────────────────────────────────────────────────

    /// Insert the final suggestion for a conversation.
    async fn insert_suggestion(
        &self,
        suggestion: &Suggestion,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Get the suggestion for a conversation.
    async fn get_suggestion(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Suggestion>, DatabaseError>;

    // ── Connections ─────────────────────────────────────────────────

    /// Store (or refresh) a connection record.
    async fn put_connection(&self, connection: &Connection) -> Result<(), DatabaseError>;

    /// Get a connection by ID.
    async fn get_connection(&self, connection_id: &str)
    -> Result<Option<Connection>, DatabaseError>;

    /// Delete a connection. Returns whether a row was removed.
    async fn delete_connection(&self, connection_id: &str) -> Result<bool, DatabaseError>;

    // ── Recovery ────────────────────────────────────────────────────

    /// Close out instances that can no longer make progress, e.g. after a
    /// restart: running executions become `failed` and unfinished
    /// conversations become `error`, both with `message`. Returns the
    /// number of conversations moved to `error`.
    async fn fail_interrupted(&self, message: &str, now: DateTime<Utc>)
    -> Result<usize, DatabaseError>;

    // ── Expiry ──────────────────────────────────────────────────────

    /// Remove everything whose expiry is before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeCounts, DatabaseError>;
}

/// The organization directory. Read-only from the workflow's perspective;
/// the admin endpoints write through it.
#[async_trait]
pub trait Directory: Send + Sync {
    /// All units, in stable order.
    async fn list_units(&self) -> Result<Vec<OrgUnit>, DatabaseError>;

    /// Insert or replace a unit.
    async fn upsert_unit(&self, unit: &OrgUnit) -> Result<(), DatabaseError>;

    /// Delete a unit. Returns whether a row was removed.
    async fn delete_unit(&self, id: &str) -> Result<bool, DatabaseError>;
}
