//! libSQL/Turso backend for the `RemoteStore` trait.
//!
//! Works against a local database file, or against a remote replica of a
//! hosted database. Every client/document write runs in one transaction
//! together with its audit row; the change event is published after commit.

mod case_records;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::auth::{AccessScope, Role};
use crate::db::{
    AuditAction, AuditLogEntry, AuditLogStore, ChangeEvent, ChangeFeed, ChangeNotifier,
    ChangeOperation, MonotonicClock, NewAuditEntry, ProfileRecord, ProfileStore, RemoteStore,
    Stats, StatsStore, TableName,
};
use crate::error::DatabaseError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    user_id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('admin', 'user')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS clients (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL CHECK (kind IN ('individual', 'organization')),
    legal_name TEXT NOT NULL,
    tax_id TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL,
    phone TEXT NOT NULL,
    occupation_or_activity TEXT,
    postal_code TEXT NOT NULL,
    street TEXT NOT NULL,
    number TEXT NOT NULL,
    complement TEXT,
    district TEXT NOT NULL,
    city TEXT NOT NULL,
    region TEXT NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_clients_created_by ON clients(created_by);

CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    description TEXT,
    file_path TEXT UNIQUE,
    file_name TEXT,
    file_size INTEGER,
    mime_type TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'review', 'approved', 'rejected')),
    tags TEXT NOT NULL DEFAULT '[]',
    created_by TEXT NOT NULL,
    reviewed_by TEXT,
    reviewed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_documents_client ON documents(client_id);
CREATE INDEX IF NOT EXISTS idx_documents_created_by ON documents(created_by);

CREATE TABLE IF NOT EXISTS audit_logs (
    id TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    action TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    actor_email TEXT NOT NULL,
    old_data TEXT,
    new_data TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_logs_actor ON audit_logs(actor_id, created_at);
"#;

/// libSQL-backed record store.
pub struct LibSqlBackend {
    db: Arc<Database>,
    remote: bool,
    notifier: ChangeNotifier,
    recent_window: chrono::Duration,
    clock: MonotonicClock,
}

impl LibSqlBackend {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open libSQL database: {e}")))?;
        Ok(Self::from_database(db, false))
    }

    /// Local replica that syncs with a hosted database.
    pub async fn new_remote_replica(
        path: &Path,
        url: &str,
        auth_token: &str,
    ) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_remote_replica(path, url.to_string(), auth_token.to_string())
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open remote replica: {e}")))?;
        db.sync()
            .await
            .map_err(|e| DatabaseError::Pool(format!("initial replica sync failed: {e}")))?;
        Ok(Self::from_database(db, true))
    }

    fn from_database(db: Database, remote: bool) -> Self {
        Self {
            db: Arc::new(db),
            remote,
            notifier: ChangeNotifier::new(),
            recent_window: chrono::Duration::days(7),
            clock: MonotonicClock::default(),
        }
    }

    #[must_use]
    pub fn with_recent_activity_window(mut self, window: chrono::Duration) -> Self {
        self.recent_window = window;
        self
    }

    /// New connection with foreign keys enforced.
    pub async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("failed to connect: {e}")))?;
        conn.execute("PRAGMA foreign_keys = ON", ()).await?;
        Ok(conn)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Pull committed writes into the replica, then notify subscribers.
    async fn after_commit(&self, table: TableName, operation: ChangeOperation) {
        if self.remote
            && let Err(e) = self.db.sync().await
        {
            tracing::warn!(error = %e, "replica sync after write failed");
        }
        self.notifier.publish(table, operation);
        if table != TableName::AuditLogs {
            self.notifier.publish(TableName::AuditLogs, ChangeOperation::Insert);
        }
    }
}

// ==================== Row helpers ====================

pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or_default()
}

pub(crate) fn opt_text(value: Option<&str>) -> libsql::Value {
    match value {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

pub(crate) fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("invalid {field} uuid: {e}")))
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    parse_timestamp(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn json_text(value: Option<&serde_json::Value>) -> libsql::Value {
    match value {
        Some(v) => libsql::Value::Text(v.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_json_opt(raw: Option<String>) -> Result<Option<serde_json::Value>, DatabaseError> {
    raw.map(|s| serde_json::from_str(&s).map_err(|e| DatabaseError::Serialization(e.to_string())))
        .transpose()
}

/// `(?1, ?2)` arguments shared by every scoped query: admin flag, user id.
pub(crate) fn scope_params(scope: &AccessScope) -> (i64, String) {
    (i64::from(scope.admin), scope.user_id.to_string())
}

/// Insert an audit row on an open connection or transaction.
pub(crate) async fn insert_audit(
    conn: &Connection,
    entry: &NewAuditEntry,
    at: &DateTime<Utc>,
) -> Result<AuditLogEntry, DatabaseError> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO audit_logs \
         (id, table_name, record_id, action, actor_id, actor_email, old_data, new_data, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id.to_string(),
            entry.table_name.as_str(),
            entry.record_id.as_str(),
            entry.action.as_str(),
            entry.actor_id.to_string(),
            entry.actor_email.as_str(),
            json_text(entry.old_data.as_ref()),
            json_text(entry.new_data.as_ref()),
            fmt_ts(at),
        ],
    )
    .await?;
    Ok(AuditLogEntry {
        id,
        table_name: entry.table_name,
        record_id: entry.record_id.clone(),
        action: entry.action,
        actor_id: entry.actor_id,
        actor_email: entry.actor_email.clone(),
        created_at: *at,
        old_data: entry.old_data.clone(),
        new_data: entry.new_data.clone(),
    })
}

fn row_to_audit_entry(row: &libsql::Row) -> Result<AuditLogEntry, DatabaseError> {
    let table_raw = get_text(row, 1);
    let action_raw = get_text(row, 3);
    Ok(AuditLogEntry {
        id: parse_uuid(&get_text(row, 0), "audit_logs.id")?,
        table_name: TableName::from_db_value(&table_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid audit table '{table_raw}'"))
        })?,
        record_id: get_text(row, 2),
        action: AuditAction::from_db_value(&action_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid audit action '{action_raw}'"))
        })?,
        actor_id: parse_uuid(&get_text(row, 4), "audit_logs.actor_id")?,
        actor_email: get_text(row, 5),
        old_data: parse_json_opt(get_opt_text(row, 6))?,
        new_data: parse_json_opt(get_opt_text(row, 7))?,
        created_at: parse_ts(&get_text(row, 8))?,
    })
}

fn row_to_profile(row: &libsql::Row) -> Result<ProfileRecord, DatabaseError> {
    let role_raw = get_text(row, 2);
    Ok(ProfileRecord {
        user_id: parse_uuid(&get_text(row, 0), "profiles.user_id")?,
        username: get_text(row, 1),
        role: Role::from_db_value(&role_raw)
            .ok_or_else(|| DatabaseError::Serialization(format!("invalid role '{role_raw}'")))?,
        created_at: parse_ts(&get_text(row, 3))?,
        updated_at: parse_ts(&get_text(row, 4))?,
    })
}

async fn count(
    conn: &Connection,
    sql: &str,
    params: impl libsql::params::IntoParams,
) -> Result<u64, DatabaseError> {
    let mut rows = conn.query(sql, params).await?;
    let value = match rows.next().await? {
        Some(row) => get_i64(&row, 0),
        None => 0,
    };
    Ok(u64::try_from(value).unwrap_or_default())
}

#[async_trait]
impl AuditLogStore for LibSqlBackend {
    async fn append_audit_entry(
        &self,
        entry: &NewAuditEntry,
    ) -> Result<AuditLogEntry, DatabaseError> {
        let conn = self.connect().await?;
        let row = insert_audit(&conn, entry, &self.now()).await?;
        self.after_commit(TableName::AuditLogs, ChangeOperation::Insert).await;
        Ok(row)
    }

    async fn list_audit_entries(
        &self,
        scope: &AccessScope,
        limit: usize,
    ) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.connect().await?;
        let (admin, user) = scope_params(scope);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = conn
            .query(
                "SELECT id, table_name, record_id, action, actor_id, actor_email, \
                 old_data, new_data, created_at \
                 FROM audit_logs WHERE (?1 = 1 OR actor_id = ?2) \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?3",
                params![admin, user, limit],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_audit_entry(&row)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl ProfileStore for LibSqlBackend {
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<ProfileRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT user_id, username, role, created_at, updated_at \
                 FROM profiles WHERE user_id = ?1",
                params![user_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_profile(&row)?)),
            None => Ok(None),
        }
    }

    async fn ensure_profile(
        &self,
        user_id: Uuid,
        username: &str,
        default_role: Role,
    ) -> Result<ProfileRecord, DatabaseError> {
        let conn = self.connect().await?;
        let now = fmt_ts(&self.now());
        let inserted = conn
            .execute(
                "INSERT INTO profiles (user_id, username, role, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4) ON CONFLICT(user_id) DO NOTHING",
                params![user_id.to_string(), username, default_role.as_str(), now],
            )
            .await?;
        if inserted > 0 {
            self.notifier.publish(TableName::Profiles, ChangeOperation::Insert);
        }
        self.get_profile(user_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "profile",
                id: user_id.to_string(),
            })
    }
}

#[async_trait]
impl StatsStore for LibSqlBackend {
    async fn user_stats(&self, scope: &AccessScope) -> Result<Stats, DatabaseError> {
        let conn = self.connect().await?;
        let (admin, user) = scope_params(scope);
        let since = fmt_ts(&(Utc::now() - self.recent_window));

        let client_count = count(
            &conn,
            "SELECT COUNT(*) FROM clients WHERE (?1 = 1 OR created_by = ?2)",
            params![admin, user.clone()],
        )
        .await?;
        let document_count = count(
            &conn,
            "SELECT COUNT(*) FROM documents d JOIN clients c ON c.id = d.client_id \
             WHERE (?1 = 1 OR d.created_by = ?2 OR c.created_by = ?2)",
            params![admin, user.clone()],
        )
        .await?;
        let pending_document_count = count(
            &conn,
            "SELECT COUNT(*) FROM documents d JOIN clients c ON c.id = d.client_id \
             WHERE (?1 = 1 OR d.created_by = ?2 OR c.created_by = ?2) AND d.status = 'pending'",
            params![admin, user.clone()],
        )
        .await?;
        let recent_activity_count = count(
            &conn,
            "SELECT COUNT(*) FROM audit_logs WHERE actor_id = ?1 AND created_at >= ?2",
            params![user, since],
        )
        .await?;

        Ok(Stats {
            client_count,
            document_count,
            pending_document_count,
            recent_activity_count,
        })
    }
}

impl ChangeFeed for LibSqlBackend {
    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.notifier.subscribe()
    }
}

#[async_trait]
impl RemoteStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| DatabaseError::Query(format!("migration failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) struct TestBackend {
        pub(crate) backend: LibSqlBackend,
        _tmpdir: tempfile::TempDir,
    }

    pub(crate) async fn setup_backend() -> TestBackend {
        // Temp-file database so every connection shares schema and state.
        let tmpdir = tempfile::tempdir().expect("tempdir");
        let db_path = tmpdir.path().join("casedesk_test.db");
        let backend = LibSqlBackend::new_local(&db_path)
            .await
            .expect("local backend should initialize");
        backend
            .run_migrations()
            .await
            .expect("migrations should succeed");
        TestBackend {
            backend,
            _tmpdir: tmpdir,
        }
    }
}
