use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::auth::Actor;
use crate::db::{ChangeEvent, ChangeOperation, Stats, StatsStore, TableName};
use crate::error::RegistryError;
use crate::sync::{Refreshable, SnapshotCell};

/// Dashboard counts for one actor, always taken from the store's own
/// aggregation and never adjusted locally.
pub struct StatsAggregator {
    store: Arc<dyn StatsStore>,
    actor: Actor,
    snapshot: SnapshotCell<Stats>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn StatsStore>, actor: Actor) -> Self {
        Self {
            store,
            actor,
            snapshot: SnapshotCell::default(),
        }
    }

    pub fn current(&self) -> Stats {
        *self.snapshot.current()
    }

    pub async fn refresh(&self) -> Result<(), RegistryError> {
        let ticket = self.snapshot.begin();
        let stats = self
            .store
            .user_stats(&self.actor.scope())
            .await
            .map_err(|e| RegistryError::fetch("stats", e))?;
        if self.snapshot.apply(ticket, stats) {
            debug!(
                clients = stats.client_count,
                documents = stats.document_count,
                pending = stats.pending_document_count,
                recent = stats.recent_activity_count,
                "stats refreshed"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Refreshable for StatsAggregator {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn wants(&self, event: &ChangeEvent) -> bool {
        match event.table {
            TableName::Clients | TableName::Documents => true,
            TableName::AuditLogs => event.operation == ChangeOperation::Insert,
            TableName::Profiles => false,
        }
    }

    async fn refresh(&self) -> Result<(), RegistryError> {
        StatsAggregator::refresh(self).await
    }
}
