use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::auth::Actor;
use crate::db::{AuditAction, AuditLogEntry, AuditLogStore, ChangeEvent, TableName};
use crate::error::RegistryError;
use crate::sync::{Refreshable, SnapshotCell};

/// Display filter over the loaded audit entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub table: Option<TableName>,
    pub action: Option<AuditAction>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.table.is_none_or(|t| entry.table_name == t)
            && self.action.is_none_or(|a| entry.action == a)
    }
}

/// Read-only view of the newest audit entries visible to one actor.
pub struct AuditTrailReader {
    store: Arc<dyn AuditLogStore>,
    actor: Actor,
    limit: usize,
    snapshot: SnapshotCell<Vec<AuditLogEntry>>,
}

impl AuditTrailReader {
    pub fn new(store: Arc<dyn AuditLogStore>, actor: Actor, limit: usize) -> Self {
        Self {
            store,
            actor,
            limit,
            snapshot: SnapshotCell::default(),
        }
    }

    pub fn list(&self) -> Arc<Vec<AuditLogEntry>> {
        self.snapshot.current()
    }

    pub fn entries(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        self.snapshot
            .current()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub async fn refresh(&self) -> Result<(), RegistryError> {
        let ticket = self.snapshot.begin();
        let rows = self
            .store
            .list_audit_entries(&self.actor.scope(), self.limit)
            .await
            .map_err(|e| RegistryError::fetch("audit trail", e))?;
        let count = rows.len();
        if self.snapshot.apply(ticket, rows) {
            debug!(count, "audit trail refreshed");
        }
        Ok(())
    }
}

#[async_trait]
impl Refreshable for AuditTrailReader {
    fn name(&self) -> &'static str {
        "audit trail"
    }

    fn wants(&self, event: &ChangeEvent) -> bool {
        event.table == TableName::AuditLogs
    }

    async fn refresh(&self) -> Result<(), RegistryError> {
        AuditTrailReader::refresh(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::db::memory::MemoryBackend;
    use crate::db::{ClientStore, UpdateClientParams};
    use crate::validation::{fixtures, validate_new_client};

    #[tokio::test]
    async fn loads_newest_entries_up_to_the_limit_and_filters() {
        let store = Arc::new(MemoryBackend::new());
        let ana = Actor::from_email("ana@office.example", Role::User);
        let input = validate_new_client(&fixtures::individual("Ana Souza")).expect("valid");
        let client = store.create_client(&ana, &input).await.expect("create");
        for phone in ["11911112222", "11933334444"] {
            store
                .update_client(
                    &ana,
                    client.id,
                    &UpdateClientParams {
                        phone: Some(phone.to_string()),
                        ..Default::default()
                    },
                )
                .await
                .expect("update");
        }

        let reader = AuditTrailReader::new(Arc::clone(&store) as Arc<dyn AuditLogStore>, ana, 2);
        reader.refresh().await.expect("refresh");

        let actions: Vec<AuditAction> = reader.list().iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Update, AuditAction::Update]);

        let creates = reader.entries(&AuditFilter {
            table: Some(TableName::Clients),
            action: Some(AuditAction::Create),
        });
        assert!(creates.is_empty());
        assert_eq!(
            reader
                .entries(&AuditFilter {
                    table: Some(TableName::Clients),
                    action: None,
                })
                .len(),
            2
        );
        assert!(
            reader
                .entries(&AuditFilter {
                    table: Some(TableName::Documents),
                    action: None,
                })
                .is_empty()
        );
    }
}
