//! libSQL backend — async `Database` and `Directory` implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written
//! as RFC 3339 text; JSON-shaped fields are stored as serialized text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection as LibSqlConnection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, Directory, PurgeCounts};
use crate::workflow::types::{
    AnalysisResult, Connection, Conversation, ConversationStatus, Execution, ExecutionOutput,
    ExecutionStatus, HistoryTurn, MessageContext, OrgUnit, Suggestion, TurnRole, Urgency,
    UserInfo,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: LibSqlConnection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &LibSqlConnection {
        &self.conn
    }

    /// Number of stored conversations.
    pub async fn count_conversations(&self) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM conversations", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_conversations: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_conversations: {e}")))?;
                Ok(count as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_conversations: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn parse_conversation_status(s: &str) -> Result<ConversationStatus, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

/// Map a libsql Row to a Conversation.
///
/// Column order matches CONVERSATION_COLUMNS.
fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("conversation row: {e}"));

    let user_json: String = row.get(2).map_err(get_err)?;
    let context_json: String = row.get(4).map_err(get_err)?;
    let status_str: String = row.get(6).map_err(get_err)?;
    let analysis_json: Option<String> = row.get(7).ok();
    let created_str: String = row.get(10).map_err(get_err)?;
    let updated_str: String = row.get(11).map_err(get_err)?;
    let expires_str: String = row.get(12).map_err(get_err)?;

    let user: UserInfo = serde_json::from_str(&user_json).unwrap_or_else(|_| UserInfo {
        user_id: row.get(1).unwrap_or_else(|_| UserInfo::ANONYMOUS.to_string()),
        ..UserInfo::anonymous()
    });
    let context: MessageContext = serde_json::from_str(&context_json).unwrap_or_default();
    let analysis = match analysis_json {
        Some(json) => Some(
            serde_json::from_str::<AnalysisResult>(&json)
                .map_err(|e| DatabaseError::Serialization(format!("analysis: {e}")))?,
        ),
        None => None,
    };

    Ok(Conversation {
        id: row.get(0).map_err(get_err)?,
        user,
        message: row.get(3).map_err(get_err)?,
        context,
        connection_id: row.get(5).ok(),
        status: parse_conversation_status(&status_str)?,
        analysis,
        error: row.get(8).ok(),
        execution_id: row.get(9).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        expires_at: parse_datetime(&expires_str),
    })
}

/// Map a libsql Row to an Execution.
///
/// Column order matches EXECUTION_COLUMNS.
fn row_to_execution(row: &libsql::Row) -> Result<Execution, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("execution row: {e}"));

    let status_str: String = row.get(2).map_err(get_err)?;
    let output_json: Option<String> = row.get(3).ok();
    let started_str: String = row.get(5).map_err(get_err)?;
    let stopped_str: Option<String> = row.get(6).ok();

    let output = match output_json {
        Some(json) => Some(
            serde_json::from_str::<ExecutionOutput>(&json)
                .map_err(|e| DatabaseError::Serialization(format!("execution output: {e}")))?,
        ),
        None => None,
    };

    Ok(Execution {
        id: row.get(0).map_err(get_err)?,
        conversation_id: row.get(1).map_err(get_err)?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        output,
        error: row.get(4).ok(),
        started_at: parse_datetime(&started_str),
        stopped_at: parse_optional_datetime(&stopped_str),
    })
}

/// Map a libsql Row to a Suggestion.
///
/// Column order matches SUGGESTION_COLUMNS.
fn row_to_suggestion(row: &libsql::Row) -> Result<Suggestion, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("suggestion row: {e}"));

    let urgency_str: String = row.get(6).map_err(get_err)?;
    let status_str: String = row.get(7).map_err(get_err)?;
    let created_str: String = row.get(8).map_err(get_err)?;

    Ok(Suggestion {
        id: row.get(0).map_err(get_err)?,
        conversation_id: row.get(1).map_err(get_err)?,
        recipient: row.get(2).map_err(get_err)?,
        department: row.get(3).ok(),
        rationale: row.get(4).map_err(get_err)?,
        category: row.get(5).map_err(get_err)?,
        urgency: Urgency::parse_label(&urgency_str).unwrap_or_default(),
        status: parse_conversation_status(&status_str)?,
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to an OrgUnit.
///
/// Column order matches UNIT_COLUMNS.
fn row_to_unit(row: &libsql::Row) -> Result<OrgUnit, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("org unit row: {e}"));

    let categories_json: String = row.get(5).map_err(get_err)?;
    let min_urgency_str: String = row.get(6).map_err(get_err)?;

    Ok(OrgUnit {
        id: row.get(0).map_err(get_err)?,
        organization_id: row.get(1).map_err(get_err)?,
        department_id: row.get(2).map_err(get_err)?,
        department_name: row.get(3).map_err(get_err)?,
        recipient: row.get(4).map_err(get_err)?,
        categories: serde_json::from_str(&categories_json)
            .map_err(|e| DatabaseError::Serialization(format!("org unit categories: {e}")))?,
        min_urgency: Urgency::parse_label(&min_urgency_str).unwrap_or_default(),
        priority: row.get(7).map_err(get_err)?,
        contact: row.get(8).ok(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const CONVERSATION_COLUMNS: &str = "id, user_id, user_info, message, context, connection_id, status, analysis, error, execution_id, created_at, updated_at, expires_at";

const EXECUTION_COLUMNS: &str =
    "id, conversation_id, status, output, error, started_at, stopped_at";

const SUGGESTION_COLUMNS: &str =
    "id, conversation_id, recipient, department, rationale, category, urgency, status, created_at";

const UNIT_COLUMNS: &str = "id, organization_id, department_id, department_name, recipient, categories, min_urgency, priority, contact";

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError> {
        let user_json = to_json(&conversation.user, "user_info")?;
        let context_json = to_json(&conversation.context, "context")?;
        let analysis_json = conversation
            .analysis
            .as_ref()
            .map(|a| to_json(a, "analysis"))
            .transpose()?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO conversations ({CONVERSATION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    conversation.id.as_str(),
                    conversation.user.user_id.as_str(),
                    user_json,
                    conversation.message.as_str(),
                    context_json,
                    opt_text(conversation.connection_id.as_deref()),
                    conversation.status.as_str(),
                    opt_text_owned(analysis_json),
                    opt_text(conversation.error.as_deref()),
                    opt_text(conversation.execution_id.as_deref()),
                    conversation.created_at.to_rfc3339(),
                    conversation.updated_at.to_rfc3339(),
                    conversation.expires_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_conversation: {e}")))?;

        debug!(conversation_id = %conversation.id, "Conversation inserted into DB");
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_conversation(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_conversation: {e}"))),
        }
    }

    async fn transition_conversation(
        &self,
        id: &str,
        next: ConversationStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let allowed = ConversationStatus::predecessors(next);
        if allowed.is_empty() {
            return Ok(false);
        }
        let placeholders = allowed
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE conversations SET status = ?1, error = COALESCE(?2, error), updated_at = ?3
                     WHERE id = ?4 AND status IN ({placeholders})"
                ),
                params![next.as_str(), opt_text(error), now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_conversation: {e}")))?;

        debug!(conversation_id = id, status = %next, changed = count > 0, "Conversation transition");
        Ok(count > 0)
    }

    async fn set_conversation_analysis(
        &self,
        id: &str,
        analysis: &AnalysisResult,
    ) -> Result<(), DatabaseError> {
        let analysis_json = to_json(analysis, "analysis")?;
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE conversations SET analysis = ?1, updated_at = ?2 WHERE id = ?3",
                params![analysis_json, now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_conversation_analysis: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conversation".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_conversation_execution(
        &self,
        id: &str,
        execution_id: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE conversations SET execution_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![execution_id, now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_conversation_execution: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conversation".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn recent_history(
        &self,
        user_id: &str,
        exclude_conversation: &str,
        limit: usize,
    ) -> Result<Vec<HistoryTurn>, DatabaseError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut rows = self
            .conn()
            .query(
                "SELECT message, analysis FROM conversations
                 WHERE user_id = ?1 AND id != ?2
                 ORDER BY created_at DESC LIMIT ?3",
                params![user_id, exclude_conversation, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_history: {e}")))?;

        let mut recent = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let message: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("recent_history row: {e}")))?;
            let analysis: Option<String> = row.get(1).ok();
            recent.push((message, analysis));
        }

        // Rows come newest first; turns are emitted oldest first.
        let mut turns = Vec::new();
        for (message, analysis_json) in recent.into_iter().rev() {
            turns.push(HistoryTurn {
                role: TurnRole::User,
                content: message,
            });
            if let Some(result) = analysis_json
                .as_deref()
                .and_then(|j| serde_json::from_str::<AnalysisResult>(j).ok())
            {
                turns.push(HistoryTurn {
                    role: TurnRole::Assistant,
                    content: result.analysis,
                });
            }
        }
        let skip = turns.len().saturating_sub(limit);
        Ok(turns.into_iter().skip(skip).collect())
    }

    // ── Executions ──────────────────────────────────────────────────

    async fn insert_execution(&self, execution: &Execution) -> Result<(), DatabaseError> {
        let output_json = execution
            .output
            .as_ref()
            .map(|o| to_json(o, "execution output"))
            .transpose()?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO executions ({EXECUTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    execution.id.as_str(),
                    execution.conversation_id.as_str(),
                    execution.status.as_str(),
                    opt_text_owned(output_json),
                    opt_text(execution.error.as_deref()),
                    execution.started_at.to_rfc3339(),
                    opt_text_owned(execution.stopped_at.map(|t| t.to_rfc3339())),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_execution: {e}")))?;

        debug!(execution_id = %execution.id, "Execution inserted into DB");
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_execution: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_execution(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_execution: {e}"))),
        }
    }

    async fn finish_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        output: Option<&ExecutionOutput>,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let output_json = output.map(|o| to_json(o, "execution output")).transpose()?;
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE executions SET status = ?1, output = ?2, error = ?3, stopped_at = ?4
                 WHERE id = ?5 AND status = 'running'",
                params![
                    status.as_str(),
                    opt_text_owned(output_json),
                    opt_text(error),
                    now,
                    id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_execution: {e}")))?;

        debug!(execution_id = id, status = status.as_str(), changed = count > 0, "Execution finished");
        Ok(count > 0)
    }

    // ── Suggestions ─────────────────────────────────────────────────

    async fn insert_suggestion(
        &self,
        suggestion: &Suggestion,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO suggestions ({SUGGESTION_COLUMNS}, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    suggestion.id.as_str(),
                    suggestion.conversation_id.as_str(),
                    suggestion.recipient.as_str(),
                    opt_text(suggestion.department.as_deref()),
                    suggestion.rationale.as_str(),
                    suggestion.category.as_str(),
                    suggestion.urgency.as_str(),
                    suggestion.status.as_str(),
                    suggestion.created_at.to_rfc3339(),
                    expires_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_suggestion: {e}")))?;

        debug!(
            conversation_id = %suggestion.conversation_id,
            recipient = %suggestion.recipient,
            "Suggestion inserted into DB"
        );
        Ok(())
    }

    async fn get_suggestion(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Suggestion>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUGGESTION_COLUMNS} FROM suggestions WHERE conversation_id = ?1"
                ),
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_suggestion: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_suggestion(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_suggestion: {e}"))),
        }
    }

    // ── Connections ─────────────────────────────────────────────────

    async fn put_connection(&self, connection: &Connection) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO connections (connection_id, user_id, connected_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(connection_id) DO UPDATE SET
                    user_id = excluded.user_id,
                    connected_at = excluded.connected_at,
                    expires_at = excluded.expires_at",
                params![
                    connection.connection_id.as_str(),
                    connection.user_id.as_str(),
                    connection.connected_at.to_rfc3339(),
                    connection.expires_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_connection: {e}")))?;
        Ok(())
    }

    async fn get_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<Connection>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT connection_id, user_id, connected_at, expires_at
                 FROM connections WHERE connection_id = ?1",
                params![connection_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_connection: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let get_err =
                    |e: libsql::Error| DatabaseError::Query(format!("connection row: {e}"));
                let connected_str: String = row.get(2).map_err(get_err)?;
                let expires_str: String = row.get(3).map_err(get_err)?;
                Ok(Some(Connection {
                    connection_id: row.get(0).map_err(get_err)?,
                    user_id: row.get(1).map_err(get_err)?,
                    connected_at: parse_datetime(&connected_str),
                    expires_at: parse_datetime(&expires_str),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_connection: {e}"))),
        }
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM connections WHERE connection_id = ?1",
                params![connection_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_connection: {e}")))?;
        Ok(count > 0)
    }

    // ── Recovery ────────────────────────────────────────────────────

    async fn fail_interrupted(
        &self,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        let stamp = now.to_rfc3339();

        let executions = conn
            .execute(
                "UPDATE executions SET status = ?1, error = ?2, stopped_at = ?3
                 WHERE status = 'running'",
                params![ExecutionStatus::Failed.as_str(), message, stamp.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_interrupted executions: {e}")))?;

        // Walk the lifecycle: initialized -> processing -> error.
        conn.execute(
            "UPDATE conversations SET status = ?1, updated_at = ?2 WHERE status = ?3",
            params![
                ConversationStatus::Processing.as_str(),
                stamp.clone(),
                ConversationStatus::Initialized.as_str()
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("fail_interrupted conversations: {e}")))?;

        let conversations = conn
            .execute(
                "UPDATE conversations SET status = ?1, error = ?2, updated_at = ?3
                 WHERE status = ?4",
                params![
                    ConversationStatus::Error.as_str(),
                    message,
                    stamp,
                    ConversationStatus::Processing.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_interrupted conversations: {e}")))?;

        if conversations > 0 || executions > 0 {
            info!(conversations, executions, "Closed out interrupted workflows");
        }
        Ok(conversations as usize)
    }

    // ── Expiry ──────────────────────────────────────────────────────

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeCounts, DatabaseError> {
        let conn = self.conn();
        let cutoff = now.to_rfc3339();

        let executions = conn
            .execute(
                "DELETE FROM executions WHERE conversation_id IN
                    (SELECT id FROM conversations WHERE expires_at < ?1)",
                params![cutoff.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_expired executions: {e}")))?;

        let suggestions = conn
            .execute(
                "DELETE FROM suggestions WHERE expires_at < ?1
                    OR conversation_id IN (SELECT id FROM conversations WHERE expires_at < ?1)",
                params![cutoff.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_expired suggestions: {e}")))?;

        let conversations = conn
            .execute(
                "DELETE FROM conversations WHERE expires_at < ?1",
                params![cutoff.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_expired conversations: {e}")))?;

        let connections = conn
            .execute(
                "DELETE FROM connections WHERE expires_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_expired connections: {e}")))?;

        let counts = PurgeCounts {
            conversations: conversations as usize,
            suggestions: suggestions as usize,
            executions: executions as usize,
            connections: connections as usize,
        };
        if counts.total() > 0 {
            info!(
                conversations = counts.conversations,
                suggestions = counts.suggestions,
                executions = counts.executions,
                connections = counts.connections,
                "Purged expired records"
            );
        }
        Ok(counts)
    }
}

#[async_trait]
impl Directory for LibSqlBackend {
    async fn list_units(&self) -> Result<Vec<OrgUnit>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {UNIT_COLUMNS} FROM org_units ORDER BY id ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_units: {e}")))?;

        let mut units = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => units.push(row_to_unit(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_units: {e}"))),
            }
        }
        Ok(units)
    }

    async fn upsert_unit(&self, unit: &OrgUnit) -> Result<(), DatabaseError> {
        let categories_json = to_json(&unit.categories, "org unit categories")?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO org_units ({UNIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO UPDATE SET
                        organization_id = excluded.organization_id,
                        department_id = excluded.department_id,
                        department_name = excluded.department_name,
                        recipient = excluded.recipient,
                        categories = excluded.categories,
                        min_urgency = excluded.min_urgency,
                        priority = excluded.priority,
                        contact = excluded.contact"
                ),
                params![
                    unit.id.as_str(),
                    unit.organization_id.as_str(),
                    unit.department_id.as_str(),
                    unit.department_name.as_str(),
                    unit.recipient.as_str(),
                    categories_json,
                    unit.min_urgency.as_str(),
                    unit.priority,
                    opt_text(unit.contact.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_unit: {e}")))?;

        info!(unit_id = %unit.id, recipient = %unit.recipient, "Directory unit saved");
        Ok(())
    }

    async fn delete_unit(&self, id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM org_units WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_unit: {e}")))?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::ExecutionOutput;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_conversation(id: &str, user_id: &str, message: &str) -> Conversation {
        let user = UserInfo {
            user_id: user_id.to_string(),
            department: "営業部".to_string(),
            ..UserInfo::anonymous()
        };
        Conversation::new(
            id,
            user,
            message,
            MessageContext::default(),
            None,
            chrono::Duration::days(7),
        )
    }

    fn make_analysis(text: &str) -> AnalysisResult {
        AnalysisResult {
            category: "人間関係".into(),
            urgency: Urgency::Medium,
            analysis: text.into(),
            suggested_actions: vec!["上司への報告".into()],
            keywords: vec!["上司".into()],
        }
    }

    fn make_execution(id: &str, conversation_id: &str) -> Execution {
        Execution {
            id: id.into(),
            conversation_id: conversation_id.into(),
            status: ExecutionStatus::Running,
            output: None,
            error: None,
            started_at: Utc::now(),
            stopped_at: None,
        }
    }

    // ── Conversation tests ──────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_conversation() {
        let db = test_db().await;
        let conv = make_conversation("c1", "u1", "上司と合わない");
        db.insert_conversation(&conv).await.unwrap();

        let fetched = db.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "c1");
        assert_eq!(fetched.user.user_id, "u1");
        assert_eq!(fetched.user.department, "営業部");
        assert_eq!(fetched.message, "上司と合わない");
        assert_eq!(fetched.status, ConversationStatus::Initialized);
        assert!(fetched.analysis.is_none());
        assert!(fetched.execution_id.is_none());
    }

    #[tokio::test]
    async fn get_conversation_not_found() {
        let db = test_db().await;
        assert!(db.get_conversation("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transitions_follow_lifecycle() {
        let db = test_db().await;
        db.insert_conversation(&make_conversation("c1", "u1", "hi"))
            .await
            .unwrap();

        // initialized -> completed is not allowed
        assert!(
            !db.transition_conversation("c1", ConversationStatus::Completed, None)
                .await
                .unwrap()
        );
        assert!(
            db.transition_conversation("c1", ConversationStatus::Processing, None)
                .await
                .unwrap()
        );
        assert!(
            db.transition_conversation("c1", ConversationStatus::Completed, None)
                .await
                .unwrap()
        );

        // Terminal status never changes again
        assert!(
            !db.transition_conversation("c1", ConversationStatus::Error, Some("late"))
                .await
                .unwrap()
        );
        let fetched = db.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(fetched.status, ConversationStatus::Completed);
        assert!(fetched.error.is_none());
    }

    #[tokio::test]
    async fn error_transition_records_message() {
        let db = test_db().await;
        db.insert_conversation(&make_conversation("c1", "u1", "hi"))
            .await
            .unwrap();
        db.transition_conversation("c1", ConversationStatus::Processing, None)
            .await
            .unwrap();
        assert!(
            db.transition_conversation("c1", ConversationStatus::Error, Some("model down"))
                .await
                .unwrap()
        );

        let fetched = db.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(fetched.status, ConversationStatus::Error);
        assert_eq!(fetched.error.as_deref(), Some("model down"));
    }

    #[tokio::test]
    async fn analysis_and_execution_are_recorded() {
        let db = test_db().await;
        db.insert_conversation(&make_conversation("c1", "u1", "hi"))
            .await
            .unwrap();
        db.set_conversation_analysis("c1", &make_analysis("関係の問題"))
            .await
            .unwrap();
        db.set_conversation_execution("c1", "e1").await.unwrap();

        let fetched = db.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(fetched.analysis.unwrap().analysis, "関係の問題");
        assert_eq!(fetched.execution_id.as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn set_analysis_on_missing_conversation_is_not_found() {
        let db = test_db().await;
        let err = db
            .set_conversation_analysis("missing", &make_analysis("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn history_is_oldest_first_and_windowed() {
        let db = test_db().await;
        for i in 0..4 {
            let mut conv = make_conversation(&format!("c{i}"), "u1", &format!("相談{i}"));
            conv.created_at = Utc::now() - chrono::Duration::minutes(10 - i);
            db.insert_conversation(&conv).await.unwrap();
            db.set_conversation_analysis(&conv.id, &make_analysis(&format!("分析{i}")))
                .await
                .unwrap();
        }
        // Someone else's conversation never appears
        db.insert_conversation(&make_conversation("other", "u2", "別人"))
            .await
            .unwrap();

        let turns = db.recent_history("u1", "c3", 3).await.unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].content, "分析1");
        assert_eq!(turns[0].role, TurnRole::Assistant);
        assert_eq!(turns[1].content, "相談2");
        assert_eq!(turns[1].role, TurnRole::User);
        assert_eq!(turns[2].content, "分析2");
        assert!(turns.iter().all(|t| !t.content.contains("3")));
    }

    #[tokio::test]
    async fn history_with_zero_window_is_empty() {
        let db = test_db().await;
        db.insert_conversation(&make_conversation("c1", "u1", "hi"))
            .await
            .unwrap();
        assert!(db.recent_history("u1", "x", 0).await.unwrap().is_empty());
    }

    // ── Execution tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn execution_finishes_once() {
        let db = test_db().await;
        db.insert_execution(&make_execution("e1", "c1")).await.unwrap();

        let output = ExecutionOutput {
            conversation_id: "c1".into(),
            analysis: "分析".into(),
            category: "人間関係".into(),
            urgency: Urgency::Medium,
            recommended_recipient: "直属の上司".into(),
            suggested_actions: vec![],
        };
        assert!(
            db.finish_execution("e1", ExecutionStatus::Succeeded, Some(&output), None)
                .await
                .unwrap()
        );
        assert!(
            !db.finish_execution("e1", ExecutionStatus::Failed, None, Some("late"))
                .await
                .unwrap()
        );

        let fetched = db.get_execution("e1").await.unwrap().unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Succeeded);
        assert_eq!(fetched.output.unwrap().recommended_recipient, "直属の上司");
        assert!(fetched.error.is_none());
        assert!(fetched.stopped_at.is_some());
    }

    #[tokio::test]
    async fn interrupted_workflows_are_closed_out() {
        let db = test_db().await;
        for id in ["fresh", "running", "done"] {
            db.insert_conversation(&make_conversation(id, "u1", "相談"))
                .await
                .unwrap();
        }
        db.transition_conversation("running", ConversationStatus::Processing, None)
            .await
            .unwrap();
        db.insert_execution(&make_execution("e-running", "running"))
            .await
            .unwrap();
        db.transition_conversation("done", ConversationStatus::Processing, None)
            .await
            .unwrap();
        db.transition_conversation("done", ConversationStatus::Completed, None)
            .await
            .unwrap();
        db.insert_execution(&make_execution("e-done", "done")).await.unwrap();
        db.finish_execution("e-done", ExecutionStatus::Succeeded, None, None)
            .await
            .unwrap();

        let failed = db.fail_interrupted("workflow interrupted", Utc::now()).await.unwrap();
        assert_eq!(failed, 2);

        for id in ["fresh", "running"] {
            let conv = db.get_conversation(id).await.unwrap().unwrap();
            assert_eq!(conv.status, ConversationStatus::Error, "{id}");
            assert_eq!(conv.error.as_deref(), Some("workflow interrupted"));
        }
        let exec = db.get_execution("e-running").await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("workflow interrupted"));
        assert!(exec.stopped_at.is_some());

        let done = db.get_conversation("done").await.unwrap().unwrap();
        assert_eq!(done.status, ConversationStatus::Completed);
        assert!(done.error.is_none());
        let exec = db.get_execution("e-done").await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Succeeded);

        // Nothing left to close out.
        assert_eq!(db.fail_interrupted("again", Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn count_conversations_counts_rows() {
        let db = test_db().await;
        assert_eq!(db.count_conversations().await.unwrap(), 0);
        db.insert_conversation(&make_conversation("c1", "u1", "hi"))
            .await
            .unwrap();
        db.insert_conversation(&make_conversation("c2", "u1", "hi"))
            .await
            .unwrap();
        assert_eq!(db.count_conversations().await.unwrap(), 2);
    }

    // ── Suggestion tests ────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_suggestion() {
        let db = test_db().await;
        let suggestion = Suggestion {
            id: "s1".into(),
            conversation_id: "c1".into(),
            recipient: "人事部".into(),
            department: Some("人事部".into()),
            rationale: "人事・組織に関する相談のため".into(),
            category: "人事・組織".into(),
            urgency: Urgency::High,
            status: ConversationStatus::Completed,
            created_at: Utc::now(),
        };
        db.insert_suggestion(&suggestion, Utc::now() + chrono::Duration::days(7))
            .await
            .unwrap();

        let fetched = db.get_suggestion("c1").await.unwrap().unwrap();
        assert_eq!(fetched.recipient, "人事部");
        assert_eq!(fetched.urgency, Urgency::High);
        assert_eq!(fetched.status, ConversationStatus::Completed);
        assert!(db.get_suggestion("c2").await.unwrap().is_none());
    }

    // ── Connection tests ────────────────────────────────────────────

    #[tokio::test]
    async fn connection_lifecycle() {
        let db = test_db().await;
        let now = Utc::now();
        let connection = Connection {
            connection_id: "ws1".into(),
            user_id: "u1".into(),
            connected_at: now,
            expires_at: now + chrono::Duration::hours(2),
        };
        db.put_connection(&connection).await.unwrap();
        // Refreshing the same id is an upsert
        db.put_connection(&connection).await.unwrap();

        let fetched = db.get_connection("ws1").await.unwrap().unwrap();
        assert_eq!(fetched.user_id, "u1");

        assert!(db.delete_connection("ws1").await.unwrap());
        assert!(!db.delete_connection("ws1").await.unwrap());
        assert!(db.get_connection("ws1").await.unwrap().is_none());
    }

    // ── Expiry tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn purge_removes_only_expired_records() {
        let db = test_db().await;
        let now = Utc::now();

        let mut old = make_conversation("old", "u1", "古い");
        old.expires_at = now - chrono::Duration::minutes(1);
        db.insert_conversation(&old).await.unwrap();
        db.insert_execution(&make_execution("e-old", "old")).await.unwrap();

        db.insert_conversation(&make_conversation("new", "u1", "新しい"))
            .await
            .unwrap();
        db.insert_execution(&make_execution("e-new", "new")).await.unwrap();

        db.put_connection(&Connection {
            connection_id: "stale".into(),
            user_id: "u1".into(),
            connected_at: now - chrono::Duration::hours(3),
            expires_at: now - chrono::Duration::hours(1),
        })
        .await
        .unwrap();

        let counts = db.purge_expired(now).await.unwrap();
        assert_eq!(counts.conversations, 1);
        assert_eq!(counts.executions, 1);
        assert_eq!(counts.connections, 1);
        assert_eq!(counts.total(), 3);

        assert!(db.get_conversation("old").await.unwrap().is_none());
        assert!(db.get_conversation("new").await.unwrap().is_some());
        assert!(db.get_execution("e-new").await.unwrap().is_some());
    }

    // ── Directory tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn directory_upsert_and_delete() {
        let db = test_db().await;
        let seeded = db.list_units().await.unwrap();
        assert!(!seeded.is_empty());

        let unit = OrgUnit {
            id: "sales-lead".into(),
            organization_id: "default".into(),
            department_id: "sales".into(),
            department_name: "営業部".into(),
            recipient: "営業部長".into(),
            categories: vec!["業務相談".into()],
            min_urgency: Urgency::Medium,
            priority: 1,
            contact: Some("sales@example.com".into()),
        };
        db.upsert_unit(&unit).await.unwrap();

        let mut changed = unit.clone();
        changed.priority = 3;
        db.upsert_unit(&changed).await.unwrap();

        let units = db.list_units().await.unwrap();
        assert_eq!(units.len(), seeded.len() + 1);
        let stored = units.iter().find(|u| u.id == "sales-lead").unwrap();
        assert_eq!(stored, &changed);

        assert!(db.delete_unit("sales-lead").await.unwrap());
        assert!(!db.delete_unit("sales-lead").await.unwrap());
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("houkokusou.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_conversation(&make_conversation("c1", "u1", "hi"))
                .await
                .unwrap();
        }

        let reopened = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(reopened.get_conversation("c1").await.unwrap().is_some());
    }
}
