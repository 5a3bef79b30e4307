use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Actor;
use crate::config::UploadConfig;
use crate::db::{
    AuditAction, AuditLogStore, ChangeEvent, ChangeOperation, CreateDocumentParams,
    DocumentRecord, DocumentStatus, DocumentStore, NewAuditEntry, StatusChange, StoredFile,
    TableName,
};
use crate::error::{RegistryError, StorageError, ValidationError};
use crate::registry::refresh_after_write;
use crate::storage::{ObjectStore, object_path_for_upload};
use crate::sync::{Refreshable, SnapshotCell};
use crate::validation::validate_upload;

/// A file to attach to a client as a new document.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub client_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub file_name: String,
    /// Guessed from `file_name` when absent.
    pub mime_type: Option<String>,
    pub bytes: Bytes,
}

/// Snapshot filter. Every set field must match.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    /// Case-insensitive substring of title, description, or client name.
    pub text: Option<String>,
    pub status: Option<DocumentStatus>,
    pub mime_type: Option<String>,
}

impl DocumentFilter {
    pub fn matches(&self, doc: &DocumentRecord) -> bool {
        if let Some(status) = self.status
            && doc.status != status
        {
            return false;
        }
        if let Some(ref mime) = self.mime_type {
            let doc_mime = doc.file.as_ref().map(|f| f.mime_type.as_str());
            if doc_mime != Some(mime.as_str()) {
                return false;
            }
        }
        if let Some(ref text) = self.text {
            let needle = text.trim().to_lowercase();
            if !needle.is_empty() {
                let hit = doc.title.to_lowercase().contains(&needle)
                    || doc
                        .description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
                    || doc
                        .client_name
                        .as_deref()
                        .is_some_and(|n| n.to_lowercase().contains(&needle));
                if !hit {
                    return false;
                }
            }
        }
        true
    }
}

/// Documents visible to one actor, optionally limited to one client, plus
/// the upload, status, download, and delete operations on them.
pub struct DocumentRegistry {
    documents: Arc<dyn DocumentStore>,
    audit: Arc<dyn AuditLogStore>,
    objects: Arc<dyn ObjectStore>,
    uploads: UploadConfig,
    actor: Actor,
    client_id: Option<Uuid>,
    snapshot: SnapshotCell<Vec<DocumentRecord>>,
}

impl DocumentRegistry {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        audit: Arc<dyn AuditLogStore>,
        objects: Arc<dyn ObjectStore>,
        uploads: UploadConfig,
        actor: Actor,
    ) -> Self {
        Self {
            documents,
            audit,
            objects,
            uploads,
            actor,
            client_id: None,
            snapshot: SnapshotCell::default(),
        }
    }

    /// Limit the snapshot to one client's documents.
    #[must_use]
    pub fn for_client(mut self, client_id: Uuid) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn client_id(&self) -> Option<Uuid> {
        self.client_id
    }

    /// Current snapshot, newest first.
    pub fn list(&self) -> Arc<Vec<DocumentRecord>> {
        self.snapshot.current()
    }

    pub fn get(&self, document_id: Uuid) -> Option<DocumentRecord> {
        self.snapshot
            .current()
            .iter()
            .find(|d| d.id == document_id)
            .cloned()
    }

    pub fn search(&self, filter: &DocumentFilter) -> Vec<DocumentRecord> {
        self.snapshot
            .current()
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect()
    }

    pub async fn refresh(&self) -> Result<(), RegistryError> {
        let ticket = self.snapshot.begin();
        let rows = self
            .documents
            .list_documents(&self.actor.scope(), self.client_id)
            .await
            .map_err(|e| RegistryError::fetch("documents", e))?;
        let count = rows.len();
        if self.snapshot.apply(ticket, rows) {
            debug!(count, client_id = ?self.client_id, "documents refreshed");
        } else {
            debug!(ticket = ticket.sequence(), "discarded stale documents fetch");
        }
        Ok(())
    }

    /// Store the file, then commit its row. A failed commit removes the
    /// stored file again before the commit error is returned.
    pub async fn upload(&self, upload: NewUpload) -> Result<DocumentRecord, RegistryError> {
        let title = upload.title.trim();
        if title.is_empty() {
            return Err(ValidationError::InvalidField {
                field: "title",
                reason: "is required".to_string(),
            }
            .into());
        }
        if let Some(scoped) = self.client_id
            && scoped != upload.client_id
        {
            return Err(ValidationError::InvalidField {
                field: "client_id",
                reason: format!("this view only holds documents of client {scoped}"),
            }
            .into());
        }
        let byte_size = upload.bytes.len() as u64;
        let mime_type = validate_upload(
            &self.uploads,
            &upload.file_name,
            byte_size,
            upload.mime_type.as_deref(),
        )?;

        let path = object_path_for_upload(self.actor.id, Utc::now(), &upload.file_name);
        self.objects
            .put(&path, upload.bytes)
            .await
            .map_err(RegistryError::Upload)?;
        debug!(%path, byte_size, "document file stored");

        let params = CreateDocumentParams {
            client_id: upload.client_id,
            title: title.to_string(),
            description: upload
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            tags: upload.tags,
            file: StoredFile {
                storage_path: path.clone(),
                original_file_name: upload.file_name,
                byte_size,
                mime_type,
            },
        };
        let record = match self.documents.create_document(&self.actor, &params).await {
            Ok(record) => record,
            Err(commit_err) => {
                if let Err(cleanup_err) = self.objects.delete(&path).await {
                    warn!(
                        %path,
                        error = %cleanup_err,
                        "failed to remove stored file after document commit failed"
                    );
                }
                return Err(RegistryError::persistence("document", commit_err));
            }
        };
        info!(document_id = %record.id, client_id = %record.client_id, "document uploaded");
        refresh_after_write(self).await;
        Ok(record)
    }

    /// Set the review status. Any status may follow any other.
    pub async fn update_status(
        &self,
        document_id: Uuid,
        status: DocumentStatus,
        reviewed_by: Option<Uuid>,
    ) -> Result<DocumentRecord, RegistryError> {
        let change = StatusChange {
            status,
            reviewed_by,
            reviewed_at: Utc::now(),
        };
        let record = self
            .documents
            .update_document_status(&self.actor, document_id, &change)
            .await
            .map_err(|e| RegistryError::persistence("document status", e))?
            .ok_or_else(|| RegistryError::NotFound {
                entity: "document",
                id: document_id.to_string(),
            })?;
        info!(%document_id, status = status.as_str(), "document status changed");
        refresh_after_write(self).await;
        Ok(record)
    }

    /// Delete the row, then its file. A file that cannot be removed once the
    /// row is gone is left behind with a warning.
    pub async fn delete(&self, document_id: Uuid) -> Result<(), RegistryError> {
        let scope = self.actor.scope();
        let existing = self
            .documents
            .get_document(&scope, document_id)
            .await
            .map_err(|e| RegistryError::fetch("document", e))?
            .ok_or_else(|| RegistryError::NotFound {
                entity: "document",
                id: document_id.to_string(),
            })?;
        let storage_path = existing.storage_path().map(str::to_string);

        let deleted = self
            .documents
            .delete_document(&self.actor, document_id)
            .await
            .map_err(|e| RegistryError::persistence("document", e))?;
        if !deleted {
            return Err(RegistryError::NotFound {
                entity: "document",
                id: document_id.to_string(),
            });
        }
        info!(%document_id, "document deleted");

        if let Some(path) = storage_path
            && let Err(e) = self.objects.delete(&path).await
        {
            warn!(%document_id, %path, error = %e, "document file orphaned after row delete");
        }
        refresh_after_write(self).await;
        Ok(())
    }

    /// Fetch the stored file and record the download in the audit trail.
    pub async fn download(&self, document: &DocumentRecord) -> Result<Bytes, RegistryError> {
        let Some(ref file) = document.file else {
            return Err(RegistryError::NotFound {
                entity: "document file",
                id: document.id.to_string(),
            });
        };
        let bytes = self
            .objects
            .get(&file.storage_path)
            .await
            .map_err(|e| match e {
                StorageError::NotFound { path } => RegistryError::NotFound {
                    entity: "document file",
                    id: path,
                },
                other => RegistryError::Storage(other),
            })?;

        let entry = NewAuditEntry {
            table_name: TableName::Documents,
            record_id: document.id.to_string(),
            action: AuditAction::Download,
            actor_id: self.actor.id,
            actor_email: self.actor.email.clone(),
            old_data: None,
            new_data: Some(json!({
                "file_path": file.storage_path,
                "file_name": file.original_file_name,
            })),
        };
        self.audit
            .append_audit_entry(&entry)
            .await
            .map_err(|e| RegistryError::persistence("download audit entry", e))?;
        info!(document_id = %document.id, bytes = bytes.len(), "document downloaded");
        Ok(bytes)
    }
}

#[async_trait]
impl Refreshable for DocumentRegistry {
    fn name(&self) -> &'static str {
        if self.client_id.is_some() {
            "client documents"
        } else {
            "documents"
        }
    }

    /// Client renames change the joined client name shown on each document.
    fn wants(&self, event: &ChangeEvent) -> bool {
        match event.table {
            TableName::Documents => true,
            TableName::Clients => event.operation == ChangeOperation::Update,
            _ => false,
        }
    }

    async fn refresh(&self) -> Result<(), RegistryError> {
        DocumentRegistry::refresh(self).await
    }
}
