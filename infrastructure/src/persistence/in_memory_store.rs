// ./infrastructure/src/persistence/in_memory_store.rs
use application::{ApplicationError, PrimaryStore};
use async_trait::async_trait;
use dashmap::DashMap;
use domain::EntityId;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Keyed primary store backed by nested concurrent maps.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPrimaryStore {
    // Table Name -> (Entity ID -> Record)
    tables: Arc<DashMap<String, DashMap<EntityId, Arc<Value>>>>,
}

impl InMemoryPrimaryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(DashMap::new()),
        }
    }

    /// Number of records held in `table`.
    pub fn record_count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |records| records.len())
    }
}

#[async_trait]
impl PrimaryStore for InMemoryPrimaryStore {
    #[instrument(skip(self, record))]
    async fn put(
        &self,
        table: &str,
        id: &EntityId,
        record: &Value,
    ) -> Result<(), ApplicationError> {
        debug!(table = %table, doc_id = %id, "Saving record to in-memory primary store");
        // Get or create the inner map for the table
        let records = self
            .tables
            .entry(table.to_string())
            .or_default()
            .downgrade();
        records.insert(id.clone(), Arc::new(record.clone()));
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, table: &str, id: &EntityId) -> Result<Option<Value>, ApplicationError> {
        debug!(table = %table, doc_id = %id, "Getting record from in-memory primary store");
        let record = self
            .tables
            .get(table)
            .and_then(|records| records.get(id).map(|record| (**record).clone()));
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn delete(&self, table: &str, id: &EntityId) -> Result<bool, ApplicationError> {
        debug!(table = %table, doc_id = %id, "Deleting record from in-memory primary store");
        match self.tables.get(table) {
            Some(records) => Ok(records.remove(id).is_some()),
            None => Ok(false), // Table or record doesn't exist
        }
    }
}
