//! Remote record store abstraction.
//!
//! Provides a backend-agnostic `RemoteStore` trait covering every table the
//! desk reads or writes, plus the change feed. Two implementations exist:
//!
//! - `libsql` (default): embedded libSQL file, or a remote replica of a
//!   hosted database when a URL is configured
//! - `memory`: process-local tables, used by tests and ephemeral runs
//!
//! Both backends behave like the hosted store the desk is written against:
//! they stamp timestamps, enforce the actor's access scope, append audit
//! rows for every client/document write, cascade client deletion to its
//! documents, and publish a `ChangeEvent` after each committed write.

#[cfg(feature = "libsql")]
pub mod libsql;

pub mod memory;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::auth::{AccessScope, Actor, Role};
use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::DatabaseError;

/// Create a database backend from configuration, run migrations, and return it.
pub async fn connect_from_config(
    config: &DatabaseConfig,
) -> Result<Arc<dyn RemoteStore>, DatabaseError> {
    match config.backend {
        DatabaseBackend::Memory => {
            let backend = memory::MemoryBackend::new()
                .with_recent_activity_window(config.recent_activity_window());
            backend.run_migrations().await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "libsql")]
        DatabaseBackend::LibSql => {
            use secrecy::ExposeSecret as _;

            let backend = if let Some(ref url) = config.libsql_url {
                let token = config.libsql_auth_token.as_ref().ok_or_else(|| {
                    DatabaseError::Pool(
                        "CASEDESK_LIBSQL_AUTH_TOKEN required when CASEDESK_LIBSQL_URL is set"
                            .to_string(),
                    )
                })?;
                libsql::LibSqlBackend::new_remote_replica(
                    &config.libsql_path,
                    url,
                    token.expose_secret(),
                )
                .await?
            } else {
                libsql::LibSqlBackend::new_local(&config.libsql_path).await?
            };
            let backend = backend.with_recent_activity_window(config.recent_activity_window());
            backend.run_migrations().await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "libsql"))]
        DatabaseBackend::LibSql => Err(DatabaseError::Pool(
            "libSQL backend not available. Enable the 'libsql' feature.".to_string(),
        )),
    }
}

// ==================== Change feed ====================

/// Tables that publish change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
    Clients,
    Documents,
    AuditLogs,
    Profiles,
}

impl TableName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clients => "clients",
            Self::Documents => "documents",
            Self::AuditLogs => "audit_logs",
            Self::Profiles => "profiles",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "clients" => Some(Self::Clients),
            "documents" => Some(Self::Documents),
            "audit_logs" => Some(Self::AuditLogs),
            "profiles" => Some(Self::Profiles),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// One committed write, as seen by every session subscribed to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: TableName,
    pub operation: ChangeOperation,
}

impl ChangeEvent {
    pub fn new(table: TableName, operation: ChangeOperation) -> Self {
        Self { table, operation }
    }
}

const CHANGE_FEED_CAPACITY: usize = 256;

/// Fan-out sender shared by the backends.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, table: TableName, operation: ChangeOperation) {
        // No listeners is the normal state outside a session.
        let _ = self.tx.send(ChangeEvent::new(table, operation));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

/// Strictly increasing wall-clock timestamps, so "newest first" never ties.
#[derive(Debug)]
pub(crate) struct MonotonicClock {
    last: Mutex<DateTime<Utc>>,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }
}

impl MonotonicClock {
    pub(crate) fn now(&self) -> DateTime<Utc> {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut now = Utc::now().trunc_subsecs(6);
        if now <= *last {
            now = *last + chrono::Duration::microseconds(1);
        }
        *last = now;
        now
    }
}

// ==================== Clients ====================

/// Reject a client row whose tax id does not fit its kind.
///
/// Backends run this on the merged row inside the write, so a caller working
/// from an outdated copy cannot leave the pair inconsistent.
pub(crate) fn check_client_tax_id(record: &ClientRecord) -> Result<(), DatabaseError> {
    let expected = record.kind.tax_id_len();
    if record.tax_id.len() != expected || !record.tax_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DatabaseError::Constraint(format!(
            "clients.tax_id must be {expected} digits for kind '{}'",
            record.kind.as_str()
        )));
    }
    Ok(())
}

/// Client entity type. The tax id format depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Individual,
    Organization,
}

impl ClientKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::Organization => "organization",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "individual" => Some(Self::Individual),
            "organization" => Some(Self::Organization),
            _ => None,
        }
    }

    /// Number of digits in a well-formed tax id for this kind.
    pub fn tax_id_len(self) -> usize {
        match self {
            Self::Individual => 11,
            Self::Organization => 14,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub postal_code: String,
    pub street: String,
    pub number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complement: Option<String>,
    pub district: String,
    pub city: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: Uuid,
    pub kind: ClientKind,
    pub legal_name: String,
    pub tax_id: String,
    pub email: String,
    pub phone: String,
    pub occupation_or_activity: Option<String>,
    pub address: Address,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateClientParams {
    pub kind: ClientKind,
    pub legal_name: String,
    pub tax_id: String,
    pub email: String,
    pub phone: String,
    pub occupation_or_activity: Option<String>,
    pub address: Address,
}

/// Changed fields only; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateClientParams {
    pub kind: Option<ClientKind>,
    pub legal_name: Option<String>,
    pub tax_id: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub occupation_or_activity: Option<Option<String>>,
    pub address: Option<Address>,
}

impl UpdateClientParams {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.legal_name.is_none()
            && self.tax_id.is_none()
            && self.email.is_none()
            && self.phone.is_none()
            && self.occupation_or_activity.is_none()
            && self.address.is_none()
    }

    pub(crate) fn apply_to(&self, record: &mut ClientRecord) {
        if let Some(kind) = self.kind {
            record.kind = kind;
        }
        if let Some(ref name) = self.legal_name {
            record.legal_name = name.clone();
        }
        if let Some(ref tax_id) = self.tax_id {
            record.tax_id = tax_id.clone();
        }
        if let Some(ref email) = self.email {
            record.email = email.clone();
        }
        if let Some(ref phone) = self.phone {
            record.phone = phone.clone();
        }
        if let Some(ref occupation) = self.occupation_or_activity {
            record.occupation_or_activity = occupation.clone();
        }
        if let Some(ref address) = self.address {
            record.address = address.clone();
        }
    }
}

// ==================== Documents ====================

/// Review state of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    InReview,
    Approved,
    Rejected,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 4] = [
        Self::Pending,
        Self::InReview,
        Self::Approved,
        Self::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InReview => "review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "review" => Some(Self::InReview),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Binary attachment metadata. A document carries all of these or none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub storage_path: String,
    pub original_file_name: String,
    pub byte_size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub client_id: Uuid,
    /// Joined from the owning client row for display and search.
    pub client_name: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub file: Option<StoredFile>,
    pub status: DocumentStatus,
    pub tags: BTreeSet<String>,
    pub created_by: Uuid,
    pub reviewed_by: Option<Uuid>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn storage_path(&self) -> Option<&str> {
        self.file.as_ref().map(|f| f.storage_path.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CreateDocumentParams {
    pub client_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub file: StoredFile,
}

/// The only mutation allowed on a document's review state.
#[derive(Debug, Clone, Copy)]
pub struct StatusChange {
    pub status: DocumentStatus,
    pub reviewed_by: Option<Uuid>,
    pub reviewed_at: DateTime<Utc>,
}

// ==================== Audit ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    View,
    Download,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::View => "VIEW",
            Self::Download => "DOWNLOAD",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "CREATE" => Some(Self::Create),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            "VIEW" => Some(Self::View),
            "DOWNLOAD" => Some(Self::Download),
            _ => None,
        }
    }
}

/// Append-only audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub table_name: TableName,
    pub record_id: String,
    pub action: AuditAction,
    pub actor_id: Uuid,
    pub actor_email: String,
    pub created_at: DateTime<Utc>,
    pub old_data: Option<serde_json::Value>,
    pub new_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub table_name: TableName,
    pub record_id: String,
    pub action: AuditAction,
    pub actor_id: Uuid,
    pub actor_email: String,
    pub old_data: Option<serde_json::Value>,
    pub new_data: Option<serde_json::Value>,
}

impl NewAuditEntry {
    /// Entry authored by the store itself for a row-level write.
    pub(crate) fn row_change<T: Serialize>(
        actor: &Actor,
        table_name: TableName,
        record_id: Uuid,
        action: AuditAction,
        old: Option<&T>,
        new: Option<&T>,
    ) -> Self {
        Self {
            table_name,
            record_id: record_id.to_string(),
            action,
            actor_id: actor.id,
            actor_email: actor.email.clone(),
            old_data: old.and_then(|v| serde_json::to_value(v).ok()),
            new_data: new.and_then(|v| serde_json::to_value(v).ok()),
        }
    }
}

// ==================== Profiles & stats ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Server-computed dashboard counts for one actor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub client_count: u64,
    pub document_count: u64,
    pub pending_document_count: u64,
    pub recent_activity_count: u64,
}

// ==================== Sub-traits ====================
//
// Each sub-trait groups related persistence methods. The `RemoteStore`
// supertrait combines them; registries depend on the narrowest set they use.

#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn create_client(
        &self,
        actor: &Actor,
        input: &CreateClientParams,
    ) -> Result<ClientRecord, DatabaseError>;
    /// Newest first.
    async fn list_clients(&self, scope: &AccessScope) -> Result<Vec<ClientRecord>, DatabaseError>;
    async fn get_client(
        &self,
        scope: &AccessScope,
        client_id: Uuid,
    ) -> Result<Option<ClientRecord>, DatabaseError>;
    async fn update_client(
        &self,
        actor: &Actor,
        client_id: Uuid,
        input: &UpdateClientParams,
    ) -> Result<Option<ClientRecord>, DatabaseError>;
    /// Deletes the client and, through the store's referential rules, its documents.
    async fn delete_client(&self, actor: &Actor, client_id: Uuid) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_document(
        &self,
        actor: &Actor,
        input: &CreateDocumentParams,
    ) -> Result<DocumentRecord, DatabaseError>;
    /// Newest first, optionally restricted to one client.
    async fn list_documents(
        &self,
        scope: &AccessScope,
        client_id: Option<Uuid>,
    ) -> Result<Vec<DocumentRecord>, DatabaseError>;
    async fn get_document(
        &self,
        scope: &AccessScope,
        document_id: Uuid,
    ) -> Result<Option<DocumentRecord>, DatabaseError>;
    async fn update_document_status(
        &self,
        actor: &Actor,
        document_id: Uuid,
        change: &StatusChange,
    ) -> Result<Option<DocumentRecord>, DatabaseError>;
    async fn delete_document(&self, actor: &Actor, document_id: Uuid)
    -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait AuditLogStore: Send + Sync {
    async fn append_audit_entry(
        &self,
        entry: &NewAuditEntry,
    ) -> Result<AuditLogEntry, DatabaseError>;
    /// Newest first, at most `limit` rows.
    async fn list_audit_entries(
        &self,
        scope: &AccessScope,
        limit: usize,
    ) -> Result<Vec<AuditLogEntry>, DatabaseError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<ProfileRecord>, DatabaseError>;
    /// Return the existing profile, or create one with `default_role`.
    async fn ensure_profile(
        &self,
        user_id: Uuid,
        username: &str,
        default_role: Role,
    ) -> Result<ProfileRecord, DatabaseError>;
}

#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn user_stats(&self, scope: &AccessScope) -> Result<Stats, DatabaseError>;
}

pub trait ChangeFeed: Send + Sync {
    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// Backend-agnostic store supertrait.
#[async_trait]
pub trait RemoteStore:
    ClientStore
    + DocumentStore
    + AuditLogStore
    + ProfileStore
    + StatsStore
    + ChangeFeed
    + Send
    + Sync
{
    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_status_uses_review_as_db_value() {
        assert_eq!(DocumentStatus::InReview.as_str(), "review");
        for status in DocumentStatus::ALL {
            assert_eq!(DocumentStatus::from_db_value(status.as_str()), Some(status));
        }
    }

    #[test]
    fn update_params_apply_only_changed_fields() {
        let now = Utc::now();
        let mut record = ClientRecord {
            id: Uuid::new_v4(),
            kind: ClientKind::Individual,
            legal_name: "Ana Souza".to_string(),
            tax_id: "12345678901".to_string(),
            email: "ana@example.com".to_string(),
            phone: "11987654321".to_string(),
            occupation_or_activity: Some("Engineer".to_string()),
            address: Address {
                postal_code: "01310100".to_string(),
                street: "Avenida Paulista".to_string(),
                number: "1000".to_string(),
                complement: None,
                district: "Bela Vista".to_string(),
                city: "Sao Paulo".to_string(),
                region: "SP".to_string(),
            },
            created_by: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
        };
        let update = UpdateClientParams {
            email: Some("ana.souza@example.com".to_string()),
            occupation_or_activity: Some(None),
            ..Default::default()
        };
        assert!(!update.is_empty());
        update.apply_to(&mut record);

        assert_eq!(record.email, "ana.souza@example.com");
        assert_eq!(record.occupation_or_activity, None);
        assert_eq!(record.legal_name, "Ana Souza");
        assert!(UpdateClientParams::default().is_empty());
    }

    #[test]
    fn clock_never_repeats() {
        let clock = MonotonicClock::default();
        let a = clock.now();
        let b = clock.now();
        assert!(b > a);
    }

    #[test]
    fn clock_stamps_whole_microseconds() {
        use chrono::Timelike;

        let clock = MonotonicClock::default();
        for _ in 0..100 {
            assert_eq!(clock.now().nanosecond() % 1_000, 0);
        }
    }

    #[tokio::test]
    async fn notifier_fans_out_to_every_subscriber() {
        let notifier = ChangeNotifier::new();
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();
        notifier.publish(TableName::Documents, ChangeOperation::Delete);

        let expected = ChangeEvent::new(TableName::Documents, ChangeOperation::Delete);
        assert_eq!(a.recv().await.expect("a"), expected);
        assert_eq!(b.recv().await.expect("b"), expected);
    }
}
