use application::{ApplicationError, IndexReceipt, IndexStore, ShardInfo};
use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use domain::{EntityId, IndexedDocument, VersionToken, VersionedDocument};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tracing::{debug, instrument, warn};

/// A document as held by the index, stamped with the version of its last write.
#[derive(Debug, Clone)]
struct StoredDocument {
    document: IndexedDocument,
    version: VersionToken,
}

/// In-memory index store with sequence-number based optimistic concurrency.
///
/// Every write takes the next value of a store-wide sequence counter. The
/// primary term stays fixed for the life of the store.
#[derive(Debug, Clone)]
pub struct InMemoryIndexStore {
    // Index Name -> (Entity ID -> Stored Document)
    indices: Arc<DashMap<String, DashMap<EntityId, StoredDocument>>>,
    next_seq_no: Arc<AtomicU64>,
    primary_term: u64,
}

impl Default for InMemoryIndexStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::with_primary_term(1)
    }

    pub fn with_primary_term(primary_term: u64) -> Self {
        Self {
            indices: Arc::new(DashMap::new()),
            next_seq_no: Arc::new(AtomicU64::new(0)),
            primary_term,
        }
    }

    /// Number of documents held in `index`.
    pub fn document_count(&self, index: &str) -> usize {
        self.indices.get(index).map_or(0, |documents| documents.len())
    }

    fn next_version(&self) -> VersionToken {
        VersionToken::new(
            self.next_seq_no.fetch_add(1, Ordering::SeqCst),
            self.primary_term,
        )
    }

    fn receipt(version: VersionToken) -> IndexReceipt {
        IndexReceipt {
            version,
            shards: ShardInfo::single(),
        }
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    #[instrument(skip(self))]
    async fn get(
        &self,
        index: &str,
        id: &EntityId,
    ) -> Result<Option<VersionedDocument>, ApplicationError> {
        debug!(index = %index, doc_id = %id, "Getting document from in-memory index");
        let found = self.indices.get(index).and_then(|documents| {
            documents.get(id).map(|stored| VersionedDocument {
                document: stored.document.clone(),
                version: stored.version,
            })
        });
        Ok(found)
    }

    #[instrument(skip(self, document))]
    async fn put(
        &self,
        index: &str,
        id: &EntityId,
        document: &IndexedDocument,
    ) -> Result<IndexReceipt, ApplicationError> {
        debug!(index = %index, doc_id = %id, "Indexing document in-memory");
        let documents = self
            .indices
            .entry(index.to_string())
            .or_default()
            .downgrade();
        // Versions are handed out under the entry guard so a later write never
        // stores an older seq_no than the one it replaces.
        let stored = match documents.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                let version = self.next_version();
                slot.insert(StoredDocument {
                    document: document.clone(),
                    version,
                });
                version
            }
            Entry::Vacant(slot) => {
                let version = self.next_version();
                slot.insert(StoredDocument {
                    document: document.clone(),
                    version,
                });
                version
            }
        };
        Ok(Self::receipt(stored))
    }

    #[instrument(skip(self, document))]
    async fn put_if_version(
        &self,
        index: &str,
        id: &EntityId,
        document: &IndexedDocument,
        version: VersionToken,
    ) -> Result<IndexReceipt, ApplicationError> {
        debug!(index = %index, doc_id = %id, expected = %version, "Conditionally indexing document in-memory");
        let documents = self
            .indices
            .entry(index.to_string())
            .or_default()
            .downgrade();
        // The entry guard keeps the compare and the swap atomic per document.
        match documents.entry(id.clone()) {
            Entry::Occupied(mut slot) if slot.get().version == version => {
                let next = self.next_version();
                slot.insert(StoredDocument {
                    document: document.clone(),
                    version: next,
                });
                Ok(Self::receipt(next))
            }
            Entry::Occupied(slot) => {
                warn!(index = %index, doc_id = %id, expected = %version, current = %slot.get().version, "Version conflict on conditional write");
                Err(ApplicationError::Conflict {
                    index: index.to_string(),
                    id: id.to_string(),
                })
            }
            Entry::Vacant(_) => {
                warn!(index = %index, doc_id = %id, expected = %version, "Conditional write on a missing document");
                Err(ApplicationError::Conflict {
                    index: index.to_string(),
                    id: id.to_string(),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, index: &str, id: &EntityId) -> Result<bool, ApplicationError> {
        debug!(index = %index, doc_id = %id, "Removing document from in-memory index");
        // It's okay if the index or document wasn't present
        Ok(self
            .indices
            .get(index)
            .is_some_and(|documents| documents.remove(id).is_some()))
    }
}
