use async_trait::async_trait;
use domain::{
    DomainError, EntityId, IdentityResolver, IndexedDocument, Permission, VersionToken,
    VersionedDocument,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{env, fmt, future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

// --- Application Errors ---

/// Which of the two backends an error came from.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Primary,
    Index,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Primary => f.write_str("primary"),
            StoreKind::Index => f.write_str("index"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError), // Identity resolution and document shape errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Document '{id}' cannot be found in index '{index}'")]
    NotFound { index: String, id: String },
    #[error("Document '{id}' in index '{index}' has been modified by another process")]
    Conflict { index: String, id: String },
    #[error("The {store} store failed: {reason}")]
    Backend { store: StoreKind, reason: String },
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A stored record no longer matches the entity type reading it.
    #[error("Record '{id}' in the {store} store is unreadable: {reason}")]
    CorruptRecord {
        store: StoreKind,
        id: String,
        reason: String,
    },
}

impl ApplicationError {
    pub fn backend(store: StoreKind, reason: impl Into<String>) -> Self {
        ApplicationError::Backend {
            store,
            reason: reason.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApplicationError::Conflict { .. })
    }
}

// --- Infrastructure Interfaces (Traits) ---

/// Keyed storage for the authoritative entity record. No versioning is exposed.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Creates or overwrites the record stored under `id`.
    async fn put(&self, table: &str, id: &EntityId, record: &Value)
    -> Result<(), ApplicationError>;
    async fn get(&self, table: &str, id: &EntityId) -> Result<Option<Value>, ApplicationError>;
    /// Deletes the record. Returns true if something was removed.
    async fn delete(&self, table: &str, id: &EntityId) -> Result<bool, ApplicationError>;
}

/// A single shard that rejected an index write.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ShardFailure {
    pub index: String,
    pub shard_id: u32,
    pub node_id: Option<String>,
    pub reason: String,
    pub primary: bool,
}

/// Replication summary of an index write.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ShardInfo {
    pub total: u32,
    pub successful: u32,
    pub failures: Vec<ShardFailure>,
}

impl ShardInfo {
    /// One shard, written successfully.
    pub fn single() -> Self {
        Self {
            total: 1,
            successful: 1,
            failures: Vec::new(),
        }
    }
}

/// Acknowledgement of an index write: the new version plus shard outcome.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct IndexReceipt {
    pub version: VersionToken,
    pub shards: ShardInfo,
}

/// Search-index storage for the permission-annotated document copy.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Reads a document together with the version it is currently at.
    async fn get(
        &self,
        index: &str,
        id: &EntityId,
    ) -> Result<Option<VersionedDocument>, ApplicationError>;
    /// Unconditional upsert.
    async fn put(
        &self,
        index: &str,
        id: &EntityId,
        document: &IndexedDocument,
    ) -> Result<IndexReceipt, ApplicationError>;
    /// Writes only if the stored document is still at `version`.
    /// Fails with `ApplicationError::Conflict` otherwise, including when the
    /// document no longer exists.
    async fn put_if_version(
        &self,
        index: &str,
        id: &EntityId,
        document: &IndexedDocument,
        version: VersionToken,
    ) -> Result<IndexReceipt, ApplicationError>;
    /// Deletes the document. Returns true if something was removed.
    async fn delete(&self, index: &str, id: &EntityId) -> Result<bool, ApplicationError>;
}

// --- Configuration ---

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const REQUEST_TIMEOUT_ENV: &str = "ENTITY_MANAGER_TIMEOUT_MS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Deadline applied to every individual backend call.
    pub request_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ManagerConfig {
    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    /// Reads the request timeout (milliseconds) from `ENTITY_MANAGER_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        Self::from_timeout_value(env::var(REQUEST_TIMEOUT_ENV).ok().as_deref())
    }

    fn from_timeout_value(raw: Option<&str>) -> Self {
        match raw {
            Some(value) => match value.trim().parse::<u64>() {
                Ok(millis) if millis > 0 => {
                    info!(
                        "Using request timeout of {}ms from environment variable {}.",
                        millis, REQUEST_TIMEOUT_ENV
                    );
                    Self::with_request_timeout(Duration::from_millis(millis))
                }
                _ => {
                    warn!(
                        "Invalid {} value '{}'. Using default request timeout {:?}.",
                        REQUEST_TIMEOUT_ENV, value, DEFAULT_REQUEST_TIMEOUT
                    );
                    Self::default()
                }
            },
            None => Self::default(),
        }
    }
}

// --- Operation Outcomes ---

/// What happened to the index copy during a create.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IndexOutcome {
    Indexed { receipt: IndexReceipt },
    /// The primary write went through but the index write did not; the stores differ.
    Diverged { reason: String },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CreateOutcome {
    pub id: EntityId,
    pub index: IndexOutcome,
}

impl CreateOutcome {
    pub fn is_indexed(&self) -> bool {
        matches!(self.index, IndexOutcome::Indexed { .. })
    }
}

// --- Entity Manager ---

/// Keeps an entity's primary record and its permission-annotated index copy in step.
///
/// The same `name` is used as the primary table and as the index. Writes to the
/// two stores are not atomic: a failed index write after a successful primary
/// write leaves them diverged, which `create` reports but does not repair.
pub struct EntityManager<T> {
    name: String,
    primary: Arc<dyn PrimaryStore>,
    index: Arc<dyn IndexStore>,
    identity: IdentityResolver<T>,
    config: ManagerConfig,
}

impl<T> EntityManager<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(
        name: impl Into<String>,
        primary: Arc<dyn PrimaryStore>,
        index: Arc<dyn IndexStore>,
        identity: IdentityResolver<T>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            primary,
            index,
            identity,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Saves the entity to the primary store, then indexes it with `permissions` attached.
    ///
    /// Only the primary write decides success. Index-write failures are logged
    /// and reported through [`IndexOutcome::Diverged`].
    #[instrument(skip(self, entity, permissions), fields(index = %self.name, permissions = permissions.len()))]
    pub async fn create(
        &self,
        entity: &T,
        permissions: &[Permission],
    ) -> Result<CreateOutcome, ApplicationError> {
        let id = self.identity.resolve(entity)?;
        info!(doc_id = %id, "Attempting to create entity");

        let record = serde_json::to_value(entity)?;
        let mut document = IndexedDocument::from_entity(entity)?;
        document.attach_permissions(permissions);

        // 1. Primary store write (source of truth for success)
        self.bounded(StoreKind::Primary, self.primary.put(&self.name, &id, &record))
            .await
            .map_err(|e| {
                error!(doc_id = %id, "Failed to save entity to primary store: {}", e);
                e
            })?;
        debug!(doc_id = %id, "Entity saved to primary store");

        // 2. Unconditional index write
        let index = match self
            .bounded(StoreKind::Index, self.index.put(&self.name, &id, &document))
            .await
        {
            Ok(receipt) => {
                self.report_shards(&id, &receipt.shards);
                info!(doc_id = %id, version = %receipt.version, "Entity created and indexed");
                IndexOutcome::Indexed { receipt }
            }
            Err(e) => {
                error!(doc_id = %id, "Index write failed after primary write, stores have diverged: {}", e);
                IndexOutcome::Diverged {
                    reason: e.to_string(),
                }
            }
        };

        Ok(CreateOutcome { id, index })
    }

    /// Replaces the indexed document with the entity's new state, keeping its
    /// existing permissions, then overwrites the primary record.
    ///
    /// Requires a prior create. A concurrent write between the read and the
    /// conditional write makes this fail with `Conflict` and leaves both stores
    /// untouched.
    #[instrument(skip(self, entity), fields(index = %self.name))]
    pub async fn update(&self, entity: &T) -> Result<IndexReceipt, ApplicationError> {
        let id = self.identity.resolve(entity)?;
        info!(doc_id = %id, "Attempting to update entity");

        let current = self.fetch_document(&id).await?;

        let record = serde_json::to_value(entity)?;
        let mut document = IndexedDocument::from_entity(entity)?;
        document.carry_forward_permissions(&current.document);

        let receipt = self.write_back(&id, &document, current.version).await?;

        self.bounded(StoreKind::Primary, self.primary.put(&self.name, &id, &record))
            .await
            .map_err(|e| {
                error!(doc_id = %id, "Index updated but primary store write failed: {}", e);
                e
            })?;
        info!(doc_id = %id, version = %receipt.version, "Entity updated");
        Ok(receipt)
    }

    /// Appends the permission's token to the target document. Duplicates are kept.
    #[instrument(skip(self, permission), fields(index = %self.name, resource_id = ?permission.resource_id))]
    pub async fn grant_permission(
        &self,
        permission: &Permission,
    ) -> Result<IndexReceipt, ApplicationError> {
        let token = permission.token();
        info!(token = %token, "Attempting to grant permission");
        self.rewrite_permissions(permission, |document| {
            document.add_permission_token(&token);
        })
        .await
    }

    /// Removes every occurrence of the permission's token from the target document.
    #[instrument(skip(self, permission), fields(index = %self.name, resource_id = ?permission.resource_id))]
    pub async fn revoke_permission(
        &self,
        permission: &Permission,
    ) -> Result<IndexReceipt, ApplicationError> {
        let token = permission.token();
        info!(token = %token, "Attempting to revoke permission");
        self.rewrite_permissions(permission, |document| {
            let removed = document.remove_permission_token(&token);
            debug!(token = %token, removed, "Permission tokens removed");
        })
        .await
    }

    /// Removes the entity from both stores. Missing ids are not an error.
    #[instrument(skip(self), fields(index = %self.name, doc_id = %id))]
    pub async fn delete(&self, id: &EntityId) -> Result<(), ApplicationError> {
        info!("Attempting to delete entity");
        let primary_removed = self
            .bounded(StoreKind::Primary, self.primary.delete(&self.name, id))
            .await?;
        let index_removed = self
            .bounded(StoreKind::Index, self.index.delete(&self.name, id))
            .await
            .map_err(|e| {
                error!("Entity removed from primary store but index delete failed: {}", e);
                e
            })?;
        info!(primary_removed, index_removed, "Entity deleted");
        Ok(())
    }

    /// Loads the authoritative record from the primary store.
    #[instrument(skip(self), fields(index = %self.name, doc_id = %id))]
    pub async fn find(&self, id: &EntityId) -> Result<Option<T>, ApplicationError> {
        let record = self
            .bounded(StoreKind::Primary, self.primary.get(&self.name, id))
            .await?;
        record
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| {
                error!(error = %e, "Stored record does not decode into the entity type");
                ApplicationError::CorruptRecord {
                    store: StoreKind::Primary,
                    id: id.to_string(),
                    reason: e.to_string(),
                }
            })
    }

    /// Loads the index copy and its current version.
    #[instrument(skip(self), fields(index = %self.name, doc_id = %id))]
    pub async fn indexed_document(
        &self,
        id: &EntityId,
    ) -> Result<Option<VersionedDocument>, ApplicationError> {
        self.bounded(StoreKind::Index, self.index.get(&self.name, id))
            .await
    }

    // Read-modify-write restricted to the permissions array of the target document.
    async fn rewrite_permissions<F>(
        &self,
        permission: &Permission,
        apply: F,
    ) -> Result<IndexReceipt, ApplicationError>
    where
        F: FnOnce(&mut IndexedDocument) + Send,
    {
        let id = permission.target().ok_or_else(|| {
            warn!("Rejected permission change without a resourceId");
            ApplicationError::InvalidArgument("resourceId cannot be blank".to_string())
        })?;

        let VersionedDocument {
            mut document,
            version,
        } = self.fetch_document(&id).await?;
        apply(&mut document);

        let receipt = self.write_back(&id, &document, version).await?;
        info!(doc_id = %id, version = %receipt.version, "Permissions updated");
        Ok(receipt)
    }

    async fn fetch_document(&self, id: &EntityId) -> Result<VersionedDocument, ApplicationError> {
        self.bounded(StoreKind::Index, self.index.get(&self.name, id))
            .await?
            .ok_or_else(|| {
                warn!(doc_id = %id, "Document cannot be found in index");
                ApplicationError::NotFound {
                    index: self.name.clone(),
                    id: id.to_string(),
                }
            })
    }

    async fn write_back(
        &self,
        id: &EntityId,
        document: &IndexedDocument,
        version: VersionToken,
    ) -> Result<IndexReceipt, ApplicationError> {
        match self
            .bounded(
                StoreKind::Index,
                self.index.put_if_version(&self.name, id, document, version),
            )
            .await
        {
            Ok(receipt) => {
                self.report_shards(id, &receipt.shards);
                Ok(receipt)
            }
            Err(e @ ApplicationError::Conflict { .. }) => {
                error!(doc_id = %id, read_version = %version, "The document has been modified by another process");
                Err(e)
            }
            Err(e) => {
                error!(doc_id = %id, "Conditional index write failed: {}", e);
                Err(e)
            }
        }
    }

    fn report_shards(&self, id: &EntityId, shards: &ShardInfo) {
        if shards.successful != shards.total {
            info!(
                doc_id = %id,
                total = shards.total,
                successful = shards.successful,
                "Some shards failed to index document"
            );
        }
        for failure in &shards.failures {
            error!(
                reason = %failure.reason,
                index = %failure.index,
                shard_id = failure.shard_id,
                node_id = ?failure.node_id,
                primary = failure.primary,
                "Shard failure while indexing document"
            );
        }
    }

    async fn bounded<R, F>(&self, store: StoreKind, call: F) -> Result<R, ApplicationError>
    where
        F: Future<Output = Result<R, ApplicationError>>,
    {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(store = %store, timeout = ?self.config.request_timeout, "Backend call timed out");
                Err(ApplicationError::backend(
                    store,
                    format!("request timed out after {:?}", self.config.request_timeout),
                ))
            }
        }
    }
}

// --- Factory ---

/// Hands out entity managers that share one handle per backend.
#[derive(Clone)]
pub struct EntityManagerFactory {
    primary: Arc<dyn PrimaryStore>,
    index: Arc<dyn IndexStore>,
    config: ManagerConfig,
}

impl EntityManagerFactory {
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        index: Arc<dyn IndexStore>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            primary,
            index,
            config,
        }
    }

    /// Builds a manager bound to `name`, used as both table and index name.
    pub fn create<T>(&self, name: &str, identity: IdentityResolver<T>) -> EntityManager<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        debug!(index = %name, entity = std::any::type_name::<T>(), "Creating entity manager");
        EntityManager::new(
            name,
            self.primary.clone(),
            self.index.clone(),
            identity,
            self.config,
        )
    }
}
