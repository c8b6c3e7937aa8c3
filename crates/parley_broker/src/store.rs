//! SQLite store: connection setup, schema management, and the write token.
//!
//! One broker process owns the store. All mutations run as
//! `BEGIN IMMEDIATE ... COMMIT` behind a process-wide mutex (the write
//! token), which removes `BEGIN IMMEDIATE` lock contention entirely.
//! Readers go straight to the pool and never take the token.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

pub const DB_FILENAME: &str = "codex_review_broker.sqlite3";
pub const DB_CONFIG_DIRNAME: &str = "parley-broker";
pub const DB_PATH_ENV_VAR: &str = "BROKER_DB_PATH";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_READ_CONNECTIONS: u32 = 5;

/// Store-level errors. Operations wrap these into `OpError::Store`;
/// schema failures abort startup.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration failed: {migration}: {source}")]
    Migration {
        migration: String,
        #[source]
        source: sqlx::Error,
    },
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS reviews (
    id              TEXT PRIMARY KEY,
    status          TEXT NOT NULL DEFAULT 'pending'
                    CHECK(status IN ('pending','claimed','in_review',
                                     'approved','changes_requested','closed')),
    intent          TEXT NOT NULL,
    agent_type      TEXT NOT NULL,
    agent_role      TEXT NOT NULL,
    phase           TEXT NOT NULL,
    plan            TEXT,
    task            TEXT,
    claimed_by      TEXT,
    verdict_reason  TEXT,
    parent_id       TEXT REFERENCES reviews(id),
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reviews_status ON reviews(status);
CREATE INDEX IF NOT EXISTS idx_reviews_parent ON reviews(parent_id);

CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY,
    review_id   TEXT NOT NULL REFERENCES reviews(id),
    sender_role TEXT NOT NULL CHECK(sender_role IN ('proposer', 'reviewer')),
    round       INTEGER NOT NULL DEFAULT 1,
    body        TEXT NOT NULL,
    metadata    TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_review ON messages(review_id, round);
"#;

/// Forward-only migrations. Column additions are idempotent because
/// "duplicate column name" errors are swallowed; table/index creations are
/// idempotent via IF NOT EXISTS.
const SCHEMA_MIGRATIONS: &[&str] = &[
    "ALTER TABLE reviews ADD COLUMN description TEXT",
    "ALTER TABLE reviews ADD COLUMN diff TEXT",
    "ALTER TABLE reviews ADD COLUMN affected_files TEXT",
    "ALTER TABLE reviews ADD COLUMN priority TEXT NOT NULL DEFAULT 'normal'",
    "ALTER TABLE reviews ADD COLUMN current_round INTEGER NOT NULL DEFAULT 1",
    "ALTER TABLE reviews ADD COLUMN counter_patch TEXT",
    "ALTER TABLE reviews ADD COLUMN counter_patch_affected_files TEXT",
    "ALTER TABLE reviews ADD COLUMN counter_patch_status TEXT",
    "ALTER TABLE reviews ADD COLUMN category TEXT",
    "ALTER TABLE reviews ADD COLUMN skip_diff_validation INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE reviews ADD COLUMN project TEXT",
    r#"CREATE TABLE IF NOT EXISTS audit_events (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        review_id   TEXT,
        event_type  TEXT NOT NULL,
        actor       TEXT,
        old_status  TEXT,
        new_status  TEXT,
        metadata    TEXT,
        created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_audit_review ON audit_events(review_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_type ON audit_events(event_type)",
    r#"CREATE TABLE IF NOT EXISTS reviewers (
        id                  TEXT PRIMARY KEY,
        display_name        TEXT NOT NULL,
        session_token       TEXT NOT NULL,
        status              TEXT NOT NULL DEFAULT 'active'
                            CHECK(status IN ('active', 'draining', 'terminated')),
        pid                 INTEGER,
        spawned_at          TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        last_active_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        terminated_at       TEXT,
        reviews_completed   INTEGER NOT NULL DEFAULT 0,
        total_review_seconds REAL NOT NULL DEFAULT 0.0,
        approvals           INTEGER NOT NULL DEFAULT 0,
        rejections          INTEGER NOT NULL DEFAULT 0
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_reviewers_session ON reviewers(session_token)",
    "CREATE INDEX IF NOT EXISTS idx_reviewers_status ON reviewers(status)",
    "ALTER TABLE reviews ADD COLUMN claim_generation INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE reviews ADD COLUMN claimed_at TEXT",
];

/// Current UTC time in the broker's canonical timestamp format:
/// ISO-8601 with millisecond precision and a Z suffix. Lexicographic
/// order equals chronological order, which the reaper cutoffs rely on.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Format an arbitrary instant the same way.
pub fn iso_from(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The embedded store plus its write token.
pub struct Store {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

/// An open `BEGIN IMMEDIATE` transaction holding the write token.
///
/// Dropping without `commit` rolls back (sqlx queues the rollback on the
/// pooled connection), so early `?` returns inside an operation leave the
/// store clean.
pub struct WriteTx<'a> {
    tx: Transaction<'static, Sqlite>,
    _token: MutexGuard<'a, ()>,
}

impl<'a> WriteTx<'a> {
    /// The underlying connection, for binding queries.
    pub fn conn(&mut self) -> &mut sqlx::SqliteConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    /// Roll back, swallowing any error. Used on operation error paths so
    /// the original failure is what surfaces.
    pub async fn rollback_quietly(self) {
        let _ = self.tx.rollback().await;
    }
}

impl Store {
    /// Open (creating if missing) the store at `path` and ensure the schema.
    pub async fn open(path: &Path) -> Result<Self, SchemaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SchemaError::Sqlx(sqlx::Error::Io(e)))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_READ_CONNECTIONS)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.ensure_schema().await?;
        info!("Store ready at {}", path.display());
        Ok(store)
    }

    /// Read-side access. Never takes the write token.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Acquire the write token and open a `BEGIN IMMEDIATE` transaction.
    pub async fn begin_write(&self) -> Result<WriteTx<'_>, sqlx::Error> {
        let token = self.write_lock.lock().await;
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(WriteTx { tx, _token: token })
    }

    /// Create tables and indexes if they don't exist, then apply migrations.
    pub async fn ensure_schema(&self) -> Result<(), SchemaError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        for migration in SCHEMA_MIGRATIONS {
            if let Err(err) = sqlx::query(migration).execute(&self.pool).await {
                // Idempotent migration: ignore only duplicate-column errors.
                if !err.to_string().to_lowercase().contains("duplicate column name") {
                    return Err(SchemaError::Migration {
                        migration: migration.to_string(),
                        source: err,
                    });
                }
            }
        }
        if self.audit_events_review_id_not_null().await? {
            self.migrate_audit_events_review_id_nullable().await?;
        }
        Ok(())
    }

    /// True when a legacy `audit_events.review_id` column still carries
    /// NOT NULL and must be rebuilt.
    async fn audit_events_review_id_not_null(&self) -> Result<bool, SchemaError> {
        let table = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'audit_events'",
        )
        .fetch_optional(&self.pool)
        .await?;
        if table.is_none() {
            return Ok(false);
        }

        let columns = sqlx::query("PRAGMA table_info(audit_events)")
            .fetch_all(&self.pool)
            .await?;
        for column in &columns {
            let name: String = column.try_get("name")?;
            if name == "review_id" {
                let notnull: i64 = column.try_get("notnull")?;
                return Ok(notnull != 0);
            }
        }
        Ok(false)
    }

    /// Rebuild the legacy audit_events table so review_id accepts NULL,
    /// preserving all rows and both indexes.
    async fn migrate_audit_events_review_id_nullable(&self) -> Result<(), SchemaError> {
        let mut tx = self.begin_write().await?;
        let result: Result<(), sqlx::Error> = async {
            sqlx::query(
                r#"CREATE TABLE audit_events_new (
                    id          INTEGER PRIMARY KEY AUTOINCREMENT,
                    review_id   TEXT,
                    event_type  TEXT NOT NULL,
                    actor       TEXT,
                    old_status  TEXT,
                    new_status  TEXT,
                    metadata    TEXT,
                    created_at  TEXT NOT NULL
                                DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                )"#,
            )
            .execute(tx.conn())
            .await?;
            sqlx::query(
                r#"INSERT INTO audit_events_new (
                       id, review_id, event_type, actor, old_status, new_status,
                       metadata, created_at
                   )
                   SELECT id, review_id, event_type, actor, old_status, new_status,
                          metadata, created_at
                   FROM audit_events"#,
            )
            .execute(tx.conn())
            .await?;
            sqlx::query("DROP TABLE audit_events").execute(tx.conn()).await?;
            sqlx::query("ALTER TABLE audit_events_new RENAME TO audit_events")
                .execute(tx.conn())
                .await?;
            sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_review ON audit_events(review_id)")
                .execute(tx.conn())
                .await?;
            sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_type ON audit_events(event_type)")
                .execute(tx.conn())
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await?;
                info!("Rebuilt legacy audit_events table (review_id now nullable)");
                Ok(())
            }
            Err(err) => {
                tx.rollback_quietly().await;
                Err(SchemaError::Migration {
                    migration: "audit_events review_id nullable rebuild".to_string(),
                    source: err,
                })
            }
        }
    }

    /// Checkpoint the WAL and close the pool. Called from lifespan teardown.
    pub async fn checkpoint_and_close(&self) {
        let _ = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await;
        self.pool.close().await;
    }
}

/// Resolve the database path.
///
/// Priority:
/// 1) Explicit BROKER_DB_PATH environment variable
/// 2) Standard user config directory (XDG_CONFIG_HOME, APPDATA, or
///    Application Support)
pub fn resolve_db_path() -> PathBuf {
    if let Ok(configured) = std::env::var(DB_PATH_ENV_VAR) {
        if !configured.is_empty() {
            return PathBuf::from(configured);
        }
    }
    default_user_config_dir().join(DB_FILENAME)
}

fn default_user_config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join(DB_CONFIG_DIRNAME);
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            if !appdata.is_empty() {
                return PathBuf::from(appdata).join(DB_CONFIG_DIRNAME);
            }
        }
    }

    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DB_CONFIG_DIRNAME)
}

// ============================================================================
// Row types
// ============================================================================

/// One row of the `reviews` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReviewRow {
    pub id: String,
    pub status: String,
    pub intent: String,
    pub description: Option<String>,
    pub diff: Option<String>,
    pub affected_files: Option<String>,
    pub agent_type: String,
    pub agent_role: String,
    pub phase: String,
    pub plan: Option<String>,
    pub task: Option<String>,
    pub project: Option<String>,
    pub priority: String,
    pub category: Option<String>,
    pub current_round: i64,
    pub counter_patch: Option<String>,
    pub counter_patch_affected_files: Option<String>,
    pub counter_patch_status: Option<String>,
    pub claimed_by: Option<String>,
    pub claim_generation: i64,
    pub claimed_at: Option<String>,
    pub skip_diff_validation: bool,
    pub verdict_reason: Option<String>,
    pub parent_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// One row of the `messages` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub review_id: String,
    pub sender_role: String,
    pub round: i64,
    pub body: String,
    pub metadata: Option<String>,
    pub created_at: String,
}

/// One row of the `reviewers` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReviewerRow {
    pub id: String,
    pub display_name: String,
    pub session_token: String,
    pub status: String,
    pub pid: Option<i64>,
    pub spawned_at: String,
    pub last_active_at: String,
    pub terminated_at: Option<String>,
    pub reviews_completed: i64,
    pub total_review_seconds: f64,
    pub approvals: i64,
    pub rejections: i64,
}

/// One row of the `audit_events` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditEventRow {
    pub id: i64,
    pub review_id: Option<String>,
    pub event_type: String,
    pub actor: Option<String>,
    pub old_status: Option<String>,
    pub new_status: Option<String>,
    pub metadata: Option<String>,
    pub created_at: String,
}
