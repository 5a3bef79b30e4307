//! Process-local backend for the `RemoteStore` trait.
//!
//! Mirrors what the hosted store does server-side: row-level audit entries,
//! access scoping, cascade on client delete, and change notifications.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use crate::auth::{AccessScope, Actor, Role};
use crate::db::{
    AuditAction, AuditLogEntry, AuditLogStore, ChangeEvent, ChangeFeed, ChangeNotifier,
    ChangeOperation, ClientRecord, ClientStore, CreateClientParams, CreateDocumentParams,
    DocumentRecord, DocumentStatus, DocumentStore, MonotonicClock, NewAuditEntry, ProfileRecord,
    ProfileStore, RemoteStore, Stats, StatsStore, StatusChange, TableName, UpdateClientParams,
    check_client_tax_id,
};
use crate::error::DatabaseError;

#[derive(Debug, Default)]
struct Tables {
    clients: Vec<ClientRecord>,
    documents: Vec<DocumentRecord>,
    audit: Vec<AuditLogEntry>,
    profiles: HashMap<Uuid, ProfileRecord>,
}

impl Tables {
    fn client_visible(&self, scope: &AccessScope, client: &ClientRecord) -> bool {
        scope.owns(client.created_by)
    }

    fn document_visible(&self, scope: &AccessScope, doc: &DocumentRecord) -> bool {
        if scope.owns(doc.created_by) {
            return true;
        }
        self.clients
            .iter()
            .any(|c| c.id == doc.client_id && c.created_by == scope.user_id)
    }

    fn client_name(&self, client_id: Uuid) -> Option<String> {
        self.clients
            .iter()
            .find(|c| c.id == client_id)
            .map(|c| c.legal_name.clone())
    }

    fn push_audit(&mut self, entry: NewAuditEntry, at: DateTime<Utc>) -> AuditLogEntry {
        let row = AuditLogEntry {
            id: Uuid::new_v4(),
            table_name: entry.table_name,
            record_id: entry.record_id,
            action: entry.action,
            actor_id: entry.actor_id,
            actor_email: entry.actor_email,
            created_at: at,
            old_data: entry.old_data,
            new_data: entry.new_data,
        };
        self.audit.push(row.clone());
        row
    }
}

/// In-memory record store.
pub struct MemoryBackend {
    tables: RwLock<Tables>,
    notifier: ChangeNotifier,
    recent_window: chrono::Duration,
    clock: MonotonicClock,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
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

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn publish_row_change(&self, table: TableName, operation: ChangeOperation) {
        self.notifier.publish(table, operation);
        self.notifier.publish(TableName::AuditLogs, ChangeOperation::Insert);
    }
}

fn newest_first<T>(rows: &mut [T], created_at: impl Fn(&T) -> DateTime<Utc>) {
    rows.sort_by_key(|row| std::cmp::Reverse(created_at(row)));
}

#[async_trait]
impl ClientStore for MemoryBackend {
    async fn create_client(
        &self,
        actor: &Actor,
        input: &CreateClientParams,
    ) -> Result<ClientRecord, DatabaseError> {
        let now = self.now();
        let record = ClientRecord {
            id: Uuid::new_v4(),
            kind: input.kind,
            legal_name: input.legal_name.clone(),
            tax_id: input.tax_id.clone(),
            email: input.email.clone(),
            phone: input.phone.clone(),
            occupation_or_activity: input.occupation_or_activity.clone(),
            address: input.address.clone(),
            created_by: actor.id,
            created_at: now,
            updated_at: now,
        };
        {
            let mut tables = self.tables.write().await;
            if tables.clients.iter().any(|c| c.tax_id == record.tax_id) {
                return Err(DatabaseError::Constraint(
                    "clients.tax_id must be unique".to_string(),
                ));
            }
            tables.clients.push(record.clone());
            let entry = NewAuditEntry::row_change(
                actor,
                TableName::Clients,
                record.id,
                AuditAction::Create,
                None,
                Some(&record),
            );
            tables.push_audit(entry, now);
        }
        self.publish_row_change(TableName::Clients, ChangeOperation::Insert);
        Ok(record)
    }

    async fn list_clients(&self, scope: &AccessScope) -> Result<Vec<ClientRecord>, DatabaseError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ClientRecord> = tables
            .clients
            .iter()
            .filter(|c| tables.client_visible(scope, c))
            .cloned()
            .collect();
        newest_first(&mut rows, |c| c.created_at);
        Ok(rows)
    }

    async fn get_client(
        &self,
        scope: &AccessScope,
        client_id: Uuid,
    ) -> Result<Option<ClientRecord>, DatabaseError> {
        let tables = self.tables.read().await;
        Ok(tables
            .clients
            .iter()
            .find(|c| c.id == client_id && tables.client_visible(scope, c))
            .cloned())
    }

    async fn update_client(
        &self,
        actor: &Actor,
        client_id: Uuid,
        input: &UpdateClientParams,
    ) -> Result<Option<ClientRecord>, DatabaseError> {
        let now = self.now();
        let scope = actor.scope();
        let updated = {
            let mut tables = self.tables.write().await;
            if let Some(ref tax_id) = input.tax_id
                && tables
                    .clients
                    .iter()
                    .any(|c| c.id != client_id && &c.tax_id == tax_id)
            {
                return Err(DatabaseError::Constraint(
                    "clients.tax_id must be unique".to_string(),
                ));
            }
            let Some(pos) = tables
                .clients
                .iter()
                .position(|c| c.id == client_id && scope.owns(c.created_by))
            else {
                return Ok(None);
            };
            let old = tables.clients[pos].clone();
            let mut new = old.clone();
            input.apply_to(&mut new);
            check_client_tax_id(&new)?;
            new.updated_at = now;
            tables.clients[pos] = new.clone();
            let entry = NewAuditEntry::row_change(
                actor,
                TableName::Clients,
                client_id,
                AuditAction::Update,
                Some(&old),
                Some(&new),
            );
            tables.push_audit(entry, now);
            new
        };
        self.publish_row_change(TableName::Clients, ChangeOperation::Update);
        Ok(Some(updated))
    }

    async fn delete_client(&self, actor: &Actor, client_id: Uuid) -> Result<bool, DatabaseError> {
        let now = self.now();
        let scope = actor.scope();
        let cascaded = {
            let mut tables = self.tables.write().await;
            let Some(pos) = tables
                .clients
                .iter()
                .position(|c| c.id == client_id && scope.owns(c.created_by))
            else {
                return Ok(false);
            };
            let removed = tables.clients.remove(pos);

            let (gone, kept): (Vec<DocumentRecord>, Vec<DocumentRecord>) =
                std::mem::take(&mut tables.documents)
                    .into_iter()
                    .partition(|d| d.client_id == client_id);
            tables.documents = kept;
            for doc in &gone {
                let entry = NewAuditEntry::row_change(
                    actor,
                    TableName::Documents,
                    doc.id,
                    AuditAction::Delete,
                    Some(doc),
                    None,
                );
                tables.push_audit(entry, now);
            }
            let entry = NewAuditEntry::row_change(
                actor,
                TableName::Clients,
                client_id,
                AuditAction::Delete,
                Some(&removed),
                None,
            );
            tables.push_audit(entry, now);
            !gone.is_empty()
        };
        if cascaded {
            self.publish_row_change(TableName::Documents, ChangeOperation::Delete);
        }
        self.publish_row_change(TableName::Clients, ChangeOperation::Delete);
        Ok(true)
    }
}

#[async_trait]
impl DocumentStore for MemoryBackend {
    async fn create_document(
        &self,
        actor: &Actor,
        input: &CreateDocumentParams,
    ) -> Result<DocumentRecord, DatabaseError> {
        let now = self.now();
        let scope = actor.scope();
        let record = {
            let mut tables = self.tables.write().await;
            let Some(client) = tables
                .clients
                .iter()
                .find(|c| c.id == input.client_id && tables.client_visible(&scope, c))
            else {
                return Err(DatabaseError::Constraint(format!(
                    "documents.client_id references unknown client {}",
                    input.client_id
                )));
            };
            let client_name = Some(client.legal_name.clone());
            if tables
                .documents
                .iter()
                .any(|d| d.storage_path() == Some(input.file.storage_path.as_str()))
            {
                return Err(DatabaseError::Constraint(
                    "documents.file_path must be unique".to_string(),
                ));
            }
            let record = DocumentRecord {
                id: Uuid::new_v4(),
                client_id: input.client_id,
                client_name,
                title: input.title.clone(),
                description: input.description.clone(),
                file: Some(input.file.clone()),
                status: DocumentStatus::Pending,
                tags: input.tags.clone(),
                created_by: actor.id,
                reviewed_by: None,
                reviewed_at: None,
                created_at: now,
                updated_at: now,
            };
            tables.documents.push(record.clone());
            let entry = NewAuditEntry::row_change(
                actor,
                TableName::Documents,
                record.id,
                AuditAction::Create,
                None,
                Some(&record),
            );
            tables.push_audit(entry, now);
            record
        };
        self.publish_row_change(TableName::Documents, ChangeOperation::Insert);
        Ok(record)
    }

    async fn list_documents(
        &self,
        scope: &AccessScope,
        client_id: Option<Uuid>,
    ) -> Result<Vec<DocumentRecord>, DatabaseError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<DocumentRecord> = tables
            .documents
            .iter()
            .filter(|d| client_id.is_none_or(|id| d.client_id == id))
            .filter(|d| tables.document_visible(scope, d))
            .map(|d| DocumentRecord {
                client_name: tables.client_name(d.client_id),
                ..d.clone()
            })
            .collect();
        newest_first(&mut rows, |d| d.created_at);
        Ok(rows)
    }

    async fn get_document(
        &self,
        scope: &AccessScope,
        document_id: Uuid,
    ) -> Result<Option<DocumentRecord>, DatabaseError> {
        let tables = self.tables.read().await;
        Ok(tables
            .documents
            .iter()
            .find(|d| d.id == document_id && tables.document_visible(scope, d))
            .map(|d| DocumentRecord {
                client_name: tables.client_name(d.client_id),
                ..d.clone()
            }))
    }

    async fn update_document_status(
        &self,
        actor: &Actor,
        document_id: Uuid,
        change: &StatusChange,
    ) -> Result<Option<DocumentRecord>, DatabaseError> {
        let now = self.now();
        let scope = actor.scope();
        let updated = {
            let mut tables = self.tables.write().await;
            let Some(pos) = tables
                .documents
                .iter()
                .position(|d| d.id == document_id && tables.document_visible(&scope, d))
            else {
                return Ok(None);
            };
            let old = tables.documents[pos].clone();
            let row = &mut tables.documents[pos];
            row.status = change.status;
            row.reviewed_at = Some(change.reviewed_at);
            if let Some(reviewer) = change.reviewed_by {
                row.reviewed_by = Some(reviewer);
            }
            row.updated_at = now;
            let new = row.clone();
            let entry = NewAuditEntry::row_change(
                actor,
                TableName::Documents,
                document_id,
                AuditAction::Update,
                Some(&old),
                Some(&new),
            );
            tables.push_audit(entry, now);
            new
        };
        self.publish_row_change(TableName::Documents, ChangeOperation::Update);
        Ok(Some(updated))
    }

    async fn delete_document(
        &self,
        actor: &Actor,
        document_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let now = self.now();
        let scope = actor.scope();
        {
            let mut tables = self.tables.write().await;
            let Some(pos) = tables
                .documents
                .iter()
                .position(|d| d.id == document_id && tables.document_visible(&scope, d))
            else {
                return Ok(false);
            };
            let removed = tables.documents.remove(pos);
            let entry = NewAuditEntry::row_change(
                actor,
                TableName::Documents,
                document_id,
                AuditAction::Delete,
                Some(&removed),
                None,
            );
            tables.push_audit(entry, now);
        }
        self.publish_row_change(TableName::Documents, ChangeOperation::Delete);
        Ok(true)
    }
}

#[async_trait]
impl AuditLogStore for MemoryBackend {
    async fn append_audit_entry(
        &self,
        entry: &NewAuditEntry,
    ) -> Result<AuditLogEntry, DatabaseError> {
        let now = self.now();
        let row = self.tables.write().await.push_audit(entry.clone(), now);
        self.notifier.publish(TableName::AuditLogs, ChangeOperation::Insert);
        Ok(row)
    }

    async fn list_audit_entries(
        &self,
        scope: &AccessScope,
        limit: usize,
    ) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<AuditLogEntry> = tables
            .audit
            .iter()
            .filter(|e| scope.owns(e.actor_id))
            .cloned()
            .collect();
        newest_first(&mut rows, |e| e.created_at);
        rows.truncate(limit);
        Ok(rows)
    }
}

#[async_trait]
impl ProfileStore for MemoryBackend {
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<ProfileRecord>, DatabaseError> {
        Ok(self.tables.read().await.profiles.get(&user_id).cloned())
    }

    async fn ensure_profile(
        &self,
        user_id: Uuid,
        username: &str,
        default_role: Role,
    ) -> Result<ProfileRecord, DatabaseError> {
        let now = self.now();
        let created = {
            let mut tables = self.tables.write().await;
            if let Some(existing) = tables.profiles.get(&user_id) {
                return Ok(existing.clone());
            }
            let profile = ProfileRecord {
                user_id,
                username: username.to_string(),
                role: default_role,
                created_at: now,
                updated_at: now,
            };
            tables.profiles.insert(user_id, profile.clone());
            profile
        };
        self.notifier.publish(TableName::Profiles, ChangeOperation::Insert);
        Ok(created)
    }
}

#[async_trait]
impl StatsStore for MemoryBackend {
    async fn user_stats(&self, scope: &AccessScope) -> Result<Stats, DatabaseError> {
        let since = Utc::now() - self.recent_window;
        let tables = self.tables.read().await;
        let visible_docs: Vec<&DocumentRecord> = tables
            .documents
            .iter()
            .filter(|d| tables.document_visible(scope, d))
            .collect();
        Ok(Stats {
            client_count: tables
                .clients
                .iter()
                .filter(|c| tables.client_visible(scope, c))
                .count() as u64,
            document_count: visible_docs.len() as u64,
            pending_document_count: visible_docs
                .iter()
                .filter(|d| d.status == DocumentStatus::Pending)
                .count() as u64,
            recent_activity_count: tables
                .audit
                .iter()
                .filter(|e| e.actor_id == scope.user_id && e.created_at >= since)
                .count() as u64,
        })
    }
}

impl ChangeFeed for MemoryBackend {
    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.notifier.subscribe()
    }
}

#[async_trait]
impl RemoteStore for MemoryBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}
