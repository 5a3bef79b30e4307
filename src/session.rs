//! One signed-in actor's working set: registries plus their change listeners.
//!
//! Listeners exist only while the session does. `Session::end` (or dropping
//! the session) stops every one of them.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::auth::Actor;
use crate::config::{AuditConfig, Config, UploadConfig};
use crate::db::memory::MemoryBackend;
use crate::db::{
    AuditLogStore, ClientStore, DocumentStore, ProfileRecord, RemoteStore, StatsStore,
    connect_from_config,
};
use crate::error::{DatabaseError, RegistryError};
use crate::registry::{AuditTrailReader, ClientRegistry, DocumentRegistry, StatsAggregator};
use crate::reports::ReportSummary;
use crate::storage::{MemoryObjectStore, ObjectStore, object_store_from_config};
use crate::sync::{Refreshable, Subscription, spawn_feed_listener};

/// Shared backends and policies every session is built from.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn RemoteStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub uploads: UploadConfig,
    pub audit: AuditConfig,
}

impl Services {
    pub async fn from_config(config: &Config) -> Result<Self, DatabaseError> {
        Ok(Self {
            store: connect_from_config(&config.database).await?,
            objects: object_store_from_config(&config.storage),
            uploads: config.uploads.clone(),
            audit: config.audit,
        })
    }

    /// Process-local store and object store with default policies.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryBackend::new()),
            objects: Arc::new(MemoryObjectStore::new()),
            uploads: UploadConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

pub struct Session {
    services: Services,
    actor: Actor,
    profile: ProfileRecord,
    clients: Arc<ClientRegistry>,
    documents: Arc<DocumentRegistry>,
    stats: Arc<StatsAggregator>,
    audit: Arc<AuditTrailReader>,
    subscriptions: Vec<Subscription>,
}

impl Session {
    /// Ensure the actor has a profile, load every registry, and start
    /// listening for changes.
    ///
    /// The actor's role is taken from the stored profile; `actor.role` only
    /// seeds a profile that does not exist yet.
    pub async fn start(services: Services, actor: Actor) -> Result<Self, RegistryError> {
        let username = actor
            .email
            .split('@')
            .next()
            .unwrap_or(actor.email.as_str())
            .to_string();
        let profile = services
            .store
            .ensure_profile(actor.id, &username, actor.role)
            .await
            .map_err(|e| RegistryError::persistence("profile", e))?;
        let actor = Actor {
            role: profile.role,
            ..actor
        };

        let store = &services.store;
        let clients = Arc::new(ClientRegistry::new(
            Arc::clone(store) as Arc<dyn ClientStore>,
            actor.clone(),
        ));
        let documents = Arc::new(Self::document_registry(&services, &actor));
        let stats = Arc::new(StatsAggregator::new(
            Arc::clone(store) as Arc<dyn StatsStore>,
            actor.clone(),
        ));
        let audit = Arc::new(AuditTrailReader::new(
            Arc::clone(store) as Arc<dyn AuditLogStore>,
            actor.clone(),
            services.audit.trail_limit,
        ));

        // Subscribe before the first load so nothing committed in between is missed.
        let subscriptions = vec![
            subscribe(&services, &clients),
            subscribe(&services, &documents),
            subscribe(&services, &stats),
            subscribe(&services, &audit),
        ];
        futures::try_join!(
            clients.refresh(),
            documents.refresh(),
            stats.refresh(),
            audit.refresh(),
        )?;

        info!(actor = %actor.email, role = actor.role.as_str(), "session started");
        Ok(Self {
            services,
            actor,
            profile,
            clients,
            documents,
            stats,
            audit,
            subscriptions,
        })
    }

    fn document_registry(services: &Services, actor: &Actor) -> DocumentRegistry {
        DocumentRegistry::new(
            Arc::clone(&services.store) as Arc<dyn DocumentStore>,
            Arc::clone(&services.store) as Arc<dyn AuditLogStore>,
            Arc::clone(&services.objects),
            services.uploads.clone(),
            actor.clone(),
        )
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn profile(&self) -> &ProfileRecord {
        &self.profile
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn documents(&self) -> &Arc<DocumentRegistry> {
        &self.documents
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn audit_trail(&self) -> &Arc<AuditTrailReader> {
        &self.audit
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.iter().filter(|s| s.is_active()).count()
    }

    /// Document view limited to one client, kept current for the rest of
    /// the session.
    pub async fn documents_for_client(
        &mut self,
        client_id: Uuid,
    ) -> Result<Arc<DocumentRegistry>, RegistryError> {
        let registry =
            Arc::new(Self::document_registry(&self.services, &self.actor).for_client(client_id));
        self.subscriptions.push(subscribe(&self.services, &registry));
        registry.refresh().await?;
        Ok(registry)
    }

    pub fn report(&self, window_days: i64) -> ReportSummary {
        ReportSummary::build(
            &self.clients.list(),
            &self.documents.list(),
            window_days,
            Utc::now(),
        )
    }

    pub fn end(mut self) {
        let stopped = self.subscriptions.len();
        self.subscriptions.clear();
        info!(actor = %self.actor.email, stopped, "session ended");
    }
}

fn subscribe<R: Refreshable>(services: &Services, target: &Arc<R>) -> Subscription {
    spawn_feed_listener(Arc::clone(target), services.store.subscribe_changes())
}
