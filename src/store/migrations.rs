//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                user_info TEXT NOT NULL DEFAULT '{}',
                message TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '{}',
                connection_id TEXT,
                status TEXT NOT NULL DEFAULT 'initialized',
                analysis TEXT,
                error TEXT,
                execution_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_user_created
                ON conversations(user_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_conversations_expires ON conversations(expires_at);

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                output TEXT,
                error TEXT,
                started_at TEXT NOT NULL,
                stopped_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_executions_conversation ON executions(conversation_id);

            CREATE TABLE IF NOT EXISTS suggestions (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL UNIQUE,
                recipient TEXT NOT NULL,
                department TEXT,
                rationale TEXT NOT NULL,
                category TEXT NOT NULL,
                urgency TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_suggestions_category_created
                ON suggestions(category, created_at);

            CREATE TABLE IF NOT EXISTS connections (
                connection_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                connected_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_connections_user ON connections(user_id);

            CREATE TABLE IF NOT EXISTS org_units (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                department_id TEXT NOT NULL,
                department_name TEXT NOT NULL,
                recipient TEXT NOT NULL,
                categories TEXT NOT NULL DEFAULT '[]',
                min_urgency TEXT NOT NULL DEFAULT 'low',
                priority INTEGER NOT NULL DEFAULT 0,
                contact TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_org_units_department_name
                ON org_units(department_name);
        "#,
    },
    Migration {
        version: 2,
        name: "default_directory",
        sql: r#"
            INSERT OR IGNORE INTO org_units
                (id, organization_id, department_id, department_name, recipient, categories, min_urgency, priority)
            VALUES
                ('direct-manager', 'default', 'line', '所属部署', '直属の上司', '["人間関係","業務相談"]', 'low', 10),
                ('hr-escalation', 'default', 'hr', '人事部', '人事部', '["人間関係","人事・組織"]', 'high', 20),
                ('hr-general', 'default', 'hr', '人事部', '人事部', '["人事・組織"]', 'low', 10),
                ('it-helpdesk', 'default', 'it', '情報システム部', '情報システム部ヘルプデスク', '["技術的な問題"]', 'low', 10),
                ('compliance', 'default', 'legal', 'コンプライアンス室', 'コンプライアンス相談窓口', '["ハラスメント","コンプライアンス"]', 'low', 5);
        "#,
    },
];

/// Run all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!("Database migrations complete (at V{version})");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
