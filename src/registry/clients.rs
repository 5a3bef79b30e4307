use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::Actor;
use crate::db::{
    ChangeEvent, ClientRecord, ClientStore, CreateClientParams, TableName, UpdateClientParams,
};
use crate::error::{RegistryError, ValidationError};
use crate::registry::refresh_after_write;
use crate::sync::{Refreshable, SnapshotCell};
use crate::validation::{validate_client_update, validate_new_client};

/// In-memory view of the clients visible to one actor.
pub struct ClientRegistry {
    store: Arc<dyn ClientStore>,
    actor: Actor,
    snapshot: SnapshotCell<Vec<ClientRecord>>,
}

impl ClientRegistry {
    pub fn new(store: Arc<dyn ClientStore>, actor: Actor) -> Self {
        Self {
            store,
            actor,
            snapshot: SnapshotCell::default(),
        }
    }

    /// Current snapshot, newest first.
    pub fn list(&self) -> Arc<Vec<ClientRecord>> {
        self.snapshot.current()
    }

    pub fn get(&self, client_id: Uuid) -> Option<ClientRecord> {
        self.snapshot
            .current()
            .iter()
            .find(|c| c.id == client_id)
            .cloned()
    }

    /// Case-insensitive match on name and email; digits in `term` also match
    /// anywhere in the tax id.
    pub fn search(&self, term: &str) -> Vec<ClientRecord> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return self.list().to_vec();
        }
        let digits: String = needle.chars().filter(char::is_ascii_digit).collect();
        self.snapshot
            .current()
            .iter()
            .filter(|c| {
                c.legal_name.to_lowercase().contains(&needle)
                    || c.email.to_lowercase().contains(&needle)
                    || (!digits.is_empty() && c.tax_id.contains(&digits))
            })
            .cloned()
            .collect()
    }

    pub async fn refresh(&self) -> Result<(), RegistryError> {
        let ticket = self.snapshot.begin();
        let rows = self
            .store
            .list_clients(&self.actor.scope())
            .await
            .map_err(|e| RegistryError::fetch("clients", e))?;
        let count = rows.len();
        if self.snapshot.apply(ticket, rows) {
            debug!(count, "clients refreshed");
        } else {
            debug!(ticket = ticket.sequence(), "discarded stale clients fetch");
        }
        Ok(())
    }

    pub async fn create(&self, input: &CreateClientParams) -> Result<ClientRecord, RegistryError> {
        let input = validate_new_client(input)?;
        let record = self
            .store
            .create_client(&self.actor, &input)
            .await
            .map_err(|e| RegistryError::persistence("client", e))?;
        info!(client_id = %record.id, kind = record.kind.as_str(), "client created");
        refresh_after_write(self).await;
        Ok(record)
    }

    /// Send only the changed fields.
    pub async fn update(
        &self,
        client_id: Uuid,
        changes: &UpdateClientParams,
    ) -> Result<ClientRecord, RegistryError> {
        if changes.is_empty() {
            return Err(ValidationError::InvalidField {
                field: "update",
                reason: "no fields to change".to_string(),
            }
            .into());
        }
        // The kind/tax id pair is checked against the stored row, not the snapshot.
        let current = if changes.kind.is_some() || changes.tax_id.is_some() {
            let row = self
                .store
                .get_client(&self.actor.scope(), client_id)
                .await
                .map_err(|e| RegistryError::fetch("client", e))?
                .ok_or_else(|| RegistryError::NotFound {
                    entity: "client",
                    id: client_id.to_string(),
                })?;
            Some(row)
        } else {
            None
        };
        let changes = validate_client_update(changes, current.as_ref())?;
        let record = self
            .store
            .update_client(&self.actor, client_id, &changes)
            .await
            .map_err(|e| RegistryError::persistence("client", e))?
            .ok_or_else(|| RegistryError::NotFound {
                entity: "client",
                id: client_id.to_string(),
            })?;
        info!(client_id = %record.id, "client updated");
        refresh_after_write(self).await;
        Ok(record)
    }

    /// Delete the client. The store removes its documents with it.
    pub async fn delete(&self, client_id: Uuid) -> Result<(), RegistryError> {
        let deleted = self
            .store
            .delete_client(&self.actor, client_id)
            .await
            .map_err(|e| RegistryError::persistence("client", e))?;
        if !deleted {
            return Err(RegistryError::NotFound {
                entity: "client",
                id: client_id.to_string(),
            });
        }
        info!(%client_id, "client deleted");
        refresh_after_write(self).await;
        Ok(())
    }
}

#[async_trait]
impl Refreshable for ClientRegistry {
    fn name(&self) -> &'static str {
        "clients"
    }

    fn wants(&self, event: &ChangeEvent) -> bool {
        event.table == TableName::Clients
    }

    async fn refresh(&self) -> Result<(), RegistryError> {
        ClientRegistry::refresh(self).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use tokio::sync::Notify;

    use super::*;
    use crate::auth::{AccessScope, Role};
    use crate::db::ClientKind;
    use crate::db::memory::MemoryBackend;
    use crate::error::DatabaseError;
    use crate::validation::fixtures;

    fn ana() -> Actor {
        Actor::from_email("ana@office.example", Role::User)
    }

    fn registry(store: Arc<MemoryBackend>) -> ClientRegistry {
        ClientRegistry::new(store, ana())
    }

    #[tokio::test]
    async fn create_refreshes_snapshot_newest_first() {
        let registry = registry(Arc::new(MemoryBackend::new()));
        let first = registry
            .create(&fixtures::individual("Ana Souza"))
            .await
            .expect("first");
        let second = registry
            .create(&fixtures::organization("Acme Comercio Ltda"))
            .await
            .expect("second");

        let ids: Vec<Uuid> = registry.list().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
        assert_eq!(first.tax_id, "12345678901");
    }

    #[tokio::test]
    async fn mismatched_tax_id_is_rejected_before_the_store() {
        let store = Arc::new(MemoryBackend::new());
        let registry = registry(Arc::clone(&store));
        let mut input = fixtures::organization("Acme Comercio Ltda");
        input.tax_id = "123.456.789-01".to_string();

        let err = registry.create(&input).await.expect_err("wrong length");
        assert!(err.is_validation());
        assert!(
            store
                .list_clients(&AccessScope {
                    user_id: Uuid::nil(),
                    admin: true
                })
                .await
                .expect("list")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn update_rechecks_tax_id_against_current_kind() {
        let registry = registry(Arc::new(MemoryBackend::new()));
        let client = registry
            .create(&fixtures::individual("Ana Souza"))
            .await
            .expect("create");

        let bad = UpdateClientParams {
            tax_id: Some("12.345.678/0001-90".to_string()),
            ..Default::default()
        };
        assert!(
            registry
                .update(client.id, &bad)
                .await
                .expect_err("cnpj on an individual")
                .is_validation()
        );

        let switch = UpdateClientParams {
            kind: Some(ClientKind::Organization),
            tax_id: Some("12.345.678/0001-90".to_string()),
            ..Default::default()
        };
        let updated = registry.update(client.id, &switch).await.expect("switch");
        assert_eq!(updated.kind, ClientKind::Organization);
        assert_eq!(updated.tax_id, "12345678000190");
        assert_eq!(
            registry.get(client.id).map(|c| c.tax_id),
            Some("12345678000190".to_string())
        );
    }

    #[tokio::test]
    async fn update_checks_the_stored_row_not_a_stale_snapshot() {
        let store = Arc::new(MemoryBackend::new());
        let first = registry(Arc::clone(&store));
        let second = registry(Arc::clone(&store));
        let client = first
            .create(&fixtures::individual("Ana Souza"))
            .await
            .expect("create");

        // `second` has never refreshed, so its snapshot does not hold the client.
        assert!(second.get(client.id).is_none());
        let renamed = second
            .update(
                client.id,
                &UpdateClientParams {
                    tax_id: Some("987.654.321-00".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("update of an existing client");
        assert_eq!(renamed.tax_id, "98765432100");

        first
            .update(
                client.id,
                &UpdateClientParams {
                    kind: Some(ClientKind::Organization),
                    tax_id: Some("12.345.678/0001-90".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("switch to organization");

        // Still an individual as far as `second` knows.
        let err = second
            .update(
                client.id,
                &UpdateClientParams {
                    tax_id: Some("987.654.321-00".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect_err("11 digits on an organization");
        assert!(err.is_validation(), "{err:?}");

        let stored = store
            .get_client(&ana().scope(), client.id)
            .await
            .expect("get")
            .expect("visible");
        assert_eq!(stored.kind, ClientKind::Organization);
        assert_eq!(stored.tax_id, "12345678000190");
    }

    #[tokio::test]
    async fn update_of_unknown_client_is_not_found() {
        let registry = registry(Arc::new(MemoryBackend::new()));
        let err = registry
            .update(
                Uuid::new_v4(),
                &UpdateClientParams {
                    kind: Some(ClientKind::Organization),
                    ..Default::default()
                },
            )
            .await
            .expect_err("missing");
        assert!(matches!(err, RegistryError::NotFound { entity: "client", .. }));
    }

    #[tokio::test]
    async fn delete_unknown_client_is_not_found() {
        let registry = registry(Arc::new(MemoryBackend::new()));
        let err = registry
            .delete(Uuid::new_v4())
            .await
            .expect_err("missing");
        assert!(matches!(err, RegistryError::NotFound { entity: "client", .. }));
    }

    #[tokio::test]
    async fn search_matches_name_email_and_tax_digits() {
        let registry = registry(Arc::new(MemoryBackend::new()));
        registry
            .create(&fixtures::individual("Ana Souza"))
            .await
            .expect("ana");
        registry
            .create(&fixtures::organization("Acme Comercio Ltda"))
            .await
            .expect("acme");

        let names = |term: &str| -> Vec<String> {
            registry
                .search(term)
                .into_iter()
                .map(|c| c.legal_name)
                .collect()
        };
        assert_eq!(names("souza"), vec!["Ana Souza".to_string()]);
        assert_eq!(names("ACME.EXAMPLE"), vec!["Acme Comercio Ltda".to_string()]);
        assert_eq!(names("345.678/0001"), vec!["Acme Comercio Ltda".to_string()]);
        assert_eq!(names("").len(), 2);
    }

    /// Fails `list_clients` on demand, delegating everything else.
    struct FlakyStore {
        inner: MemoryBackend,
        fail_lists: AtomicUsize,
    }

    #[async_trait]
    impl ClientStore for FlakyStore {
        async fn create_client(
            &self,
            actor: &Actor,
            input: &CreateClientParams,
        ) -> Result<ClientRecord, DatabaseError> {
            self.inner.create_client(actor, input).await
        }

        async fn list_clients(
            &self,
            scope: &AccessScope,
        ) -> Result<Vec<ClientRecord>, DatabaseError> {
            if self.fail_lists.load(Ordering::SeqCst) > 0 {
                self.fail_lists.fetch_sub(1, Ordering::SeqCst);
                return Err(DatabaseError::Pool("connection reset".to_string()));
            }
            self.inner.list_clients(scope).await
        }

        async fn get_client(
            &self,
            scope: &AccessScope,
            client_id: Uuid,
        ) -> Result<Option<ClientRecord>, DatabaseError> {
            self.inner.get_client(scope, client_id).await
        }

        async fn update_client(
            &self,
            actor: &Actor,
            client_id: Uuid,
            input: &UpdateClientParams,
        ) -> Result<Option<ClientRecord>, DatabaseError> {
            self.inner.update_client(actor, client_id, input).await
        }

        async fn delete_client(
            &self,
            actor: &Actor,
            client_id: Uuid,
        ) -> Result<bool, DatabaseError> {
            self.inner.delete_client(actor, client_id).await
        }
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let store = Arc::new(FlakyStore {
            inner: MemoryBackend::new(),
            fail_lists: AtomicUsize::new(0),
        });
        let registry = ClientRegistry::new(Arc::clone(&store) as Arc<dyn ClientStore>, ana());
        registry
            .create(&fixtures::individual("Ana Souza"))
            .await
            .expect("create");
        let before = registry.list();

        store.fail_lists.store(1, Ordering::SeqCst);
        let err = registry.refresh().await.expect_err("fetch fails");
        assert!(matches!(err, RegistryError::Fetch { what: "clients", .. }));
        assert_eq!(registry.list(), before);
    }

    #[tokio::test]
    async fn create_succeeds_even_when_follow_up_refresh_fails() {
        let store = Arc::new(FlakyStore {
            inner: MemoryBackend::new(),
            fail_lists: AtomicUsize::new(1),
        });
        let registry = ClientRegistry::new(Arc::clone(&store) as Arc<dyn ClientStore>, ana());

        let created = registry
            .create(&fixtures::individual("Ana Souza"))
            .await
            .expect("write committed");
        assert!(registry.list().is_empty());

        registry.refresh().await.expect("second refresh");
        assert_eq!(registry.get(created.id).map(|c| c.id), Some(created.id));
    }

    /// First `list_clients` call parks until released; later calls return at once.
    struct GatedStore {
        inner: MemoryBackend,
        gate: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClientStore for GatedStore {
        async fn create_client(
            &self,
            actor: &Actor,
            input: &CreateClientParams,
        ) -> Result<ClientRecord, DatabaseError> {
            self.inner.create_client(actor, input).await
        }

        async fn list_clients(
            &self,
            scope: &AccessScope,
        ) -> Result<Vec<ClientRecord>, DatabaseError> {
            let rows = self.inner.list_clients(scope).await;
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.gate.notified().await;
            }
            rows
        }

        async fn get_client(
            &self,
            scope: &AccessScope,
            client_id: Uuid,
        ) -> Result<Option<ClientRecord>, DatabaseError> {
            self.inner.get_client(scope, client_id).await
        }

        async fn update_client(
            &self,
            actor: &Actor,
            client_id: Uuid,
            input: &UpdateClientParams,
        ) -> Result<Option<ClientRecord>, DatabaseError> {
            self.inner.update_client(actor, client_id, input).await
        }

        async fn delete_client(
            &self,
            actor: &Actor,
            client_id: Uuid,
        ) -> Result<bool, DatabaseError> {
            self.inner.delete_client(actor, client_id).await
        }
    }

    #[tokio::test]
    async fn late_completion_of_an_older_refresh_is_discarded() {
        let store = Arc::new(GatedStore {
            inner: MemoryBackend::new(),
            gate: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(ClientRegistry::new(
            Arc::clone(&store) as Arc<dyn ClientStore>,
            ana(),
        ));

        // Older refresh reads an empty table, then stalls.
        let slow = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.refresh().await })
        };
        tokio::task::yield_now().await;

        store
            .inner
            .create_client(&ana(), &fixtures::individual("Ana Souza"))
            .await
            .expect("create");
        registry.refresh().await.expect("newer refresh");
        assert_eq!(registry.list().len(), 1);

        store.gate.notify_one();
        slow.await.expect("join").expect("slow refresh");
        assert_eq!(registry.list().len(), 1);
    }
}
