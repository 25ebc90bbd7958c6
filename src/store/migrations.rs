//! Schema for the coordination store.
//!
//! Versions are applied in ascending order and recorded in `_migrations`;
//! a version already recorded is never re-run.

use std::collections::BTreeSet;

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append-only. Never edit a version that has shipped.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "coordination_state",
        sql: r#"
            CREATE TABLE IF NOT EXISTS thread_locks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'processing',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS processing_state (
                id TEXT PRIMARY KEY,
                last_thread_id TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pending_requests (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                insured_inferred INTEGER NOT NULL,
                insured_name TEXT NOT NULL,
                holder_inferred INTEGER NOT NULL,
                holder_name TEXT NOT NULL,
                holder_addr_1 TEXT NOT NULL,
                holder_addr_2 TEXT NOT NULL,
                send_to_email TEXT NOT NULL,
                to_emails TEXT NOT NULL DEFAULT '[]',
                cc_emails TEXT NOT NULL DEFAULT '[]',
                last_message_id TEXT NOT NULL DEFAULT '',
                actionable INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_pending_requests_status ON pending_requests(status);
        "#,
    },
    Migration {
        version: 2,
        name: "flow_event_log",
        sql: r#"
            CREATE TABLE IF NOT EXISTS flow_threads (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS flow_thread_services (
                flow_id TEXT NOT NULL REFERENCES flow_threads(id) ON DELETE CASCADE,
                service TEXT NOT NULL,
                first_seen_at TEXT NOT NULL,
                PRIMARY KEY (flow_id, service)
            );

            CREATE TABLE IF NOT EXISTS flow_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                flow_id TEXT NOT NULL REFERENCES flow_threads(id) ON DELETE CASCADE,
                service TEXT NOT NULL,
                step TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_flow_events_flow ON flow_events(flow_id);
        "#,
    },
    Migration {
        version: 3,
        name: "classifier_errors_and_watch",
        sql: r#"
            CREATE TABLE IF NOT EXISTS classifier_errors (
                id TEXT PRIMARY KEY,
                stage TEXT NOT NULL,
                subject TEXT NOT NULL,
                content TEXT NOT NULL,
                llm_response TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_classifier_errors_created ON classifier_errors(created_at);

            CREATE TABLE IF NOT EXISTS watch_state (
                mailbox TEXT PRIMARY KEY,
                expiration INTEGER NOT NULL,
                history_id TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
    },
];

/// Bring the schema up to the latest version.
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
    .map_err(|e| DatabaseError::Migration(format!("cannot create _migrations: {e}")))?;

    let applied = applied_versions(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();
    if pending.is_empty() {
        tracing::debug!(version = latest_version(), "Schema up to date");
        return Ok(());
    }

    for migration in pending {
        tracing::info!(version = migration.version, name = migration.name, "Migrating schema");
        conn.execute_batch(migration.sql).await.map_err(|e| {
            DatabaseError::Migration(format!("V{} {}: {e}", migration.version, migration.name))
        })?;
        conn.execute(
            "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| {
            DatabaseError::Migration(format!("cannot record V{}: {e}", migration.version))
        })?;
    }
    Ok(())
}

fn latest_version() -> i64 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

async fn applied_versions(conn: &Connection) -> Result<BTreeSet<i64>, DatabaseError> {
    let mut rows = conn
        .query("SELECT version FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("cannot list applied versions: {e}")))?;

    let mut versions = BTreeSet::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("cannot read applied versions: {e}")))?
    {
        let version: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Migration(format!("bad version row: {e}")))?;
        versions.insert(version);
    }
    Ok(versions)
}
