use std::collections::BTreeSet;

use async_trait::async_trait;
use libsql::{Connection, params};
use uuid::Uuid;

use crate::auth::{AccessScope, Actor};
use crate::db::{
    Address, AuditAction, ChangeOperation, ClientKind, ClientRecord, ClientStore,
    CreateClientParams, CreateDocumentParams, DocumentRecord, DocumentStatus, DocumentStore,
    NewAuditEntry, StatusChange, StoredFile, TableName, UpdateClientParams, check_client_tax_id,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, fmt_ts, get_i64, get_opt_text, get_text, insert_audit, opt_text, parse_ts,
    parse_uuid, scope_params,
};

const CLIENT_COLUMNS: &str = "id, kind, legal_name, tax_id, email, phone, occupation_or_activity, \
     postal_code, street, number, complement, district, city, region, \
     created_by, created_at, updated_at";

const DOCUMENT_SELECT: &str = "SELECT d.id, d.client_id, c.legal_name, d.title, d.description, \
     d.file_path, d.file_name, d.file_size, d.mime_type, d.status, d.tags, \
     d.created_by, d.reviewed_by, d.reviewed_at, d.created_at, d.updated_at \
     FROM documents d JOIN clients c ON c.id = d.client_id";

const DOCUMENT_SCOPE: &str = "(?1 = 1 OR d.created_by = ?2 OR c.created_by = ?2)";

fn parse_client_kind(raw: &str) -> Result<ClientKind, DatabaseError> {
    ClientKind::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid client kind '{raw}'")))
}

fn parse_document_status(raw: &str) -> Result<DocumentStatus, DatabaseError> {
    DocumentStatus::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid document status '{raw}'")))
}

fn parse_tags(raw: &str) -> Result<BTreeSet<String>, DatabaseError> {
    if raw.trim().is_empty() {
        return Ok(BTreeSet::new());
    }
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn tags_json(tags: &BTreeSet<String>) -> Result<String, DatabaseError> {
    serde_json::to_string(tags).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn row_to_client_record(row: &libsql::Row) -> Result<ClientRecord, DatabaseError> {
    Ok(ClientRecord {
        id: parse_uuid(&get_text(row, 0), "clients.id")?,
        kind: parse_client_kind(&get_text(row, 1))?,
        legal_name: get_text(row, 2),
        tax_id: get_text(row, 3),
        email: get_text(row, 4),
        phone: get_text(row, 5),
        occupation_or_activity: get_opt_text(row, 6),
        address: Address {
            postal_code: get_text(row, 7),
            street: get_text(row, 8),
            number: get_text(row, 9),
            complement: get_opt_text(row, 10),
            district: get_text(row, 11),
            city: get_text(row, 12),
            region: get_text(row, 13),
        },
        created_by: parse_uuid(&get_text(row, 14), "clients.created_by")?,
        created_at: parse_ts(&get_text(row, 15))?,
        updated_at: parse_ts(&get_text(row, 16))?,
    })
}

fn row_to_document_record(row: &libsql::Row) -> Result<DocumentRecord, DatabaseError> {
    let file = match get_opt_text(row, 5) {
        Some(storage_path) => Some(StoredFile {
            storage_path,
            original_file_name: get_text(row, 6),
            byte_size: u64::try_from(get_i64(row, 7)).unwrap_or_default(),
            mime_type: get_text(row, 8),
        }),
        None => None,
    };
    Ok(DocumentRecord {
        id: parse_uuid(&get_text(row, 0), "documents.id")?,
        client_id: parse_uuid(&get_text(row, 1), "documents.client_id")?,
        client_name: get_opt_text(row, 2),
        title: get_text(row, 3),
        description: get_opt_text(row, 4),
        file,
        status: parse_document_status(&get_text(row, 9))?,
        tags: parse_tags(&get_text(row, 10))?,
        created_by: parse_uuid(&get_text(row, 11), "documents.created_by")?,
        reviewed_by: get_opt_text(row, 12)
            .map(|value| parse_uuid(&value, "documents.reviewed_by"))
            .transpose()?,
        reviewed_at: get_opt_text(row, 13)
            .map(|value| parse_ts(&value))
            .transpose()?,
        created_at: parse_ts(&get_text(row, 14))?,
        updated_at: parse_ts(&get_text(row, 15))?,
    })
}

async fn select_client(
    conn: &Connection,
    scope: &AccessScope,
    client_id: Uuid,
) -> Result<Option<ClientRecord>, DatabaseError> {
    let (admin, user) = scope_params(scope);
    let mut rows = conn
        .query(
            &format!(
                "SELECT {CLIENT_COLUMNS} FROM clients \
                 WHERE (?1 = 1 OR created_by = ?2) AND id = ?3 LIMIT 1"
            ),
            params![admin, user, client_id.to_string()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_client_record(&row)?)),
        None => Ok(None),
    }
}

async fn select_document(
    conn: &Connection,
    scope: &AccessScope,
    document_id: Uuid,
) -> Result<Option<DocumentRecord>, DatabaseError> {
    let (admin, user) = scope_params(scope);
    let mut rows = conn
        .query(
            &format!("{DOCUMENT_SELECT} WHERE {DOCUMENT_SCOPE} AND d.id = ?3 LIMIT 1"),
            params![admin, user, document_id.to_string()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_document_record(&row)?)),
        None => Ok(None),
    }
}

async fn select_documents_of_client(
    conn: &Connection,
    client_id: Uuid,
) -> Result<Vec<DocumentRecord>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("{DOCUMENT_SELECT} WHERE d.client_id = ?1"),
            params![client_id.to_string()],
        )
        .await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(row_to_document_record(&row)?);
    }
    Ok(out)
}

#[async_trait]
impl ClientStore for LibSqlBackend {
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

        let conn = self.connect().await?;
        let tx = conn.transaction().await?;
        tx.execute(
            &format!(
                "INSERT INTO clients ({CLIENT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)"
            ),
            params![
                record.id.to_string(),
                record.kind.as_str(),
                record.legal_name.as_str(),
                record.tax_id.as_str(),
                record.email.as_str(),
                record.phone.as_str(),
                opt_text(record.occupation_or_activity.as_deref()),
                record.address.postal_code.as_str(),
                record.address.street.as_str(),
                record.address.number.as_str(),
                opt_text(record.address.complement.as_deref()),
                record.address.district.as_str(),
                record.address.city.as_str(),
                record.address.region.as_str(),
                actor.id.to_string(),
                fmt_ts(&now),
            ],
        )
        .await?;
        let entry = NewAuditEntry::row_change(
            actor,
            TableName::Clients,
            record.id,
            AuditAction::Create,
            None,
            Some(&record),
        );
        insert_audit(&tx, &entry, &now).await?;
        tx.commit().await?;

        self.after_commit(TableName::Clients, ChangeOperation::Insert).await;
        Ok(record)
    }

    async fn list_clients(&self, scope: &AccessScope) -> Result<Vec<ClientRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let (admin, user) = scope_params(scope);
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CLIENT_COLUMNS} FROM clients WHERE (?1 = 1 OR created_by = ?2) \
                     ORDER BY created_at DESC, rowid DESC"
                ),
                params![admin, user],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_client_record(&row)?);
        }
        Ok(out)
    }

    async fn get_client(
        &self,
        scope: &AccessScope,
        client_id: Uuid,
    ) -> Result<Option<ClientRecord>, DatabaseError> {
        let conn = self.connect().await?;
        select_client(&conn, scope, client_id).await
    }

    async fn update_client(
        &self,
        actor: &Actor,
        client_id: Uuid,
        input: &UpdateClientParams,
    ) -> Result<Option<ClientRecord>, DatabaseError> {
        let now = self.now();
        let conn = self.connect().await?;
        let tx = conn.transaction().await?;
        let Some(old) = select_client(&tx, &actor.scope(), client_id).await? else {
            return Ok(None);
        };
        let mut new = old.clone();
        input.apply_to(&mut new);
        if let Err(err) = check_client_tax_id(&new) {
            tx.rollback().await?;
            return Err(err);
        }
        new.updated_at = now;

        tx.execute(
            "UPDATE clients SET kind = ?2, legal_name = ?3, tax_id = ?4, email = ?5, phone = ?6, \
             occupation_or_activity = ?7, postal_code = ?8, street = ?9, number = ?10, \
             complement = ?11, district = ?12, city = ?13, region = ?14, updated_at = ?15 \
             WHERE id = ?1",
            params![
                client_id.to_string(),
                new.kind.as_str(),
                new.legal_name.as_str(),
                new.tax_id.as_str(),
                new.email.as_str(),
                new.phone.as_str(),
                opt_text(new.occupation_or_activity.as_deref()),
                new.address.postal_code.as_str(),
                new.address.street.as_str(),
                new.address.number.as_str(),
                opt_text(new.address.complement.as_deref()),
                new.address.district.as_str(),
                new.address.city.as_str(),
                new.address.region.as_str(),
                fmt_ts(&now),
            ],
        )
        .await?;
        let entry = NewAuditEntry::row_change(
            actor,
            TableName::Clients,
            client_id,
            AuditAction::Update,
            Some(&old),
            Some(&new),
        );
        insert_audit(&tx, &entry, &now).await?;
        tx.commit().await?;

        self.after_commit(TableName::Clients, ChangeOperation::Update).await;
        Ok(Some(new))
    }

    async fn delete_client(&self, actor: &Actor, client_id: Uuid) -> Result<bool, DatabaseError> {
        let now = self.now();
        let conn = self.connect().await?;
        let tx = conn.transaction().await?;
        let Some(old) = select_client(&tx, &actor.scope(), client_id).await? else {
            return Ok(false);
        };
        let documents = select_documents_of_client(&tx, client_id).await?;
        for doc in &documents {
            let entry = NewAuditEntry::row_change(
                actor,
                TableName::Documents,
                doc.id,
                AuditAction::Delete,
                Some(doc),
                None,
            );
            insert_audit(&tx, &entry, &now).await?;
        }
        tx.execute(
            "DELETE FROM clients WHERE id = ?1",
            params![client_id.to_string()],
        )
        .await?;
        let entry = NewAuditEntry::row_change(
            actor,
            TableName::Clients,
            client_id,
            AuditAction::Delete,
            Some(&old),
            None,
        );
        insert_audit(&tx, &entry, &now).await?;
        tx.commit().await?;

        if !documents.is_empty() {
            self.after_commit(TableName::Documents, ChangeOperation::Delete).await;
        }
        self.after_commit(TableName::Clients, ChangeOperation::Delete).await;
        Ok(true)
    }
}

#[async_trait]
impl DocumentStore for LibSqlBackend {
    async fn create_document(
        &self,
        actor: &Actor,
        input: &CreateDocumentParams,
    ) -> Result<DocumentRecord, DatabaseError> {
        let now = self.now();
        let conn = self.connect().await?;
        let tx = conn.transaction().await?;
        let Some(client) = select_client(&tx, &actor.scope(), input.client_id).await? else {
            return Err(DatabaseError::Constraint(format!(
                "documents.client_id references unknown client {}",
                input.client_id
            )));
        };

        let record = DocumentRecord {
            id: Uuid::new_v4(),
            client_id: input.client_id,
            client_name: Some(client.legal_name),
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
        tx.execute(
            "INSERT INTO documents (id, client_id, title, description, file_path, file_name, \
             file_size, mime_type, status, tags, created_by, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                record.id.to_string(),
                record.client_id.to_string(),
                record.title.as_str(),
                opt_text(record.description.as_deref()),
                input.file.storage_path.as_str(),
                input.file.original_file_name.as_str(),
                i64::try_from(input.file.byte_size).unwrap_or(i64::MAX),
                input.file.mime_type.as_str(),
                record.status.as_str(),
                tags_json(&record.tags)?,
                actor.id.to_string(),
                fmt_ts(&now),
            ],
        )
        .await?;
        let entry = NewAuditEntry::row_change(
            actor,
            TableName::Documents,
            record.id,
            AuditAction::Create,
            None,
            Some(&record),
        );
        insert_audit(&tx, &entry, &now).await?;
        tx.commit().await?;

        self.after_commit(TableName::Documents, ChangeOperation::Insert).await;
        Ok(record)
    }

    async fn list_documents(
        &self,
        scope: &AccessScope,
        client_id: Option<Uuid>,
    ) -> Result<Vec<DocumentRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let (admin, user) = scope_params(scope);
        let mut rows = conn
            .query(
                &format!(
                    "{DOCUMENT_SELECT} WHERE {DOCUMENT_SCOPE} \
                     AND (?3 IS NULL OR d.client_id = ?3) \
                     ORDER BY d.created_at DESC, d.rowid DESC"
                ),
                params![
                    admin,
                    user,
                    opt_text(client_id.map(|id| id.to_string()).as_deref()),
                ],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_document_record(&row)?);
        }
        Ok(out)
    }

    async fn get_document(
        &self,
        scope: &AccessScope,
        document_id: Uuid,
    ) -> Result<Option<DocumentRecord>, DatabaseError> {
        let conn = self.connect().await?;
        select_document(&conn, scope, document_id).await
    }

    async fn update_document_status(
        &self,
        actor: &Actor,
        document_id: Uuid,
        change: &StatusChange,
    ) -> Result<Option<DocumentRecord>, DatabaseError> {
        let now = self.now();
        let scope = actor.scope();
        let conn = self.connect().await?;
        let tx = conn.transaction().await?;
        let Some(old) = select_document(&tx, &scope, document_id).await? else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE documents SET status = ?2, reviewed_at = ?3, \
             reviewed_by = COALESCE(?4, reviewed_by), updated_at = ?5 WHERE id = ?1",
            params![
                document_id.to_string(),
                change.status.as_str(),
                fmt_ts(&change.reviewed_at),
                opt_text(change.reviewed_by.map(|id| id.to_string()).as_deref()),
                fmt_ts(&now),
            ],
        )
        .await?;
        let Some(new) = select_document(&tx, &scope, document_id).await? else {
            return Err(DatabaseError::NotFound {
                entity: "document",
                id: document_id.to_string(),
            });
        };
        let entry = NewAuditEntry::row_change(
            actor,
            TableName::Documents,
            document_id,
            AuditAction::Update,
            Some(&old),
            Some(&new),
        );
        insert_audit(&tx, &entry, &now).await?;
        tx.commit().await?;

        self.after_commit(TableName::Documents, ChangeOperation::Update).await;
        Ok(Some(new))
    }

    async fn delete_document(
        &self,
        actor: &Actor,
        document_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let now = self.now();
        let conn = self.connect().await?;
        let tx = conn.transaction().await?;
        let Some(old) = select_document(&tx, &actor.scope(), document_id).await? else {
            return Ok(false);
        };
        tx.execute(
            "DELETE FROM documents WHERE id = ?1",
            params![document_id.to_string()],
        )
        .await?;
        let entry = NewAuditEntry::row_change(
            actor,
            TableName::Documents,
            document_id,
            AuditAction::Delete,
            Some(&old),
            None,
        );
        insert_audit(&tx, &entry, &now).await?;
        tx.commit().await?;

        self.after_commit(TableName::Documents, ChangeOperation::Delete).await;
        Ok(true)
    }
}
