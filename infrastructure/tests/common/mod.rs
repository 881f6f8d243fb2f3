//! Shared fixtures for entity manager tests: sample entities and store wrappers
//! that inject failures, delays, and rival writes.
#![allow(dead_code)]

use application::{
    ApplicationError, EntityManager, EntityManagerFactory, IndexReceipt, IndexStore,
    ManagerConfig, ShardFailure, ShardInfo, StoreKind,
};
use async_trait::async_trait;
use domain::{EntityId, IdentityResolver, Identified, IndexedDocument, VersionToken, VersionedDocument};
use infrastructure::{InMemoryIndexStore, InMemoryPrimaryStore};
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

pub const PEOPLE: &str = "people";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub age: u32,
}

impl Person {
    pub fn new(id: &str, first_name: &str) -> Self {
        Self {
            id: id.to_string(),
            first_name: first_name.to_string(),
            last_name: "vvv".to_string(),
            age: 213,
        }
    }
}

impl Identified for Person {
    fn identity(&self) -> String {
        self.id.clone()
    }
}

/// An entity that carries its own permission-shaped field.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Profile {
    pub handle: String,
    pub bio: String,
    pub permissions: Vec<String>,
}

pub struct Harness<T> {
    pub manager: EntityManager<T>,
    pub primary: Arc<InMemoryPrimaryStore>,
    pub index: Arc<InMemoryIndexStore>,
}

pub fn people() -> Harness<Person> {
    let primary = Arc::new(InMemoryPrimaryStore::new());
    let index = Arc::new(InMemoryIndexStore::new());
    let factory = EntityManagerFactory::new(primary.clone(), index.clone(), ManagerConfig::default());
    Harness {
        manager: factory.create(PEOPLE, IdentityResolver::identified()),
        primary,
        index,
    }
}

pub fn people_over(index: Arc<dyn IndexStore>, config: ManagerConfig) -> (EntityManager<Person>, Arc<InMemoryPrimaryStore>) {
    let primary = Arc::new(InMemoryPrimaryStore::new());
    let manager = EntityManager::new(
        PEOPLE,
        primary.clone(),
        index,
        IdentityResolver::identified(),
        config,
    );
    (manager, primary)
}

pub fn id(raw: &str) -> EntityId {
    EntityId::from(raw)
}

/// Index store whose every call fails with a backend error.
#[derive(Debug, Default)]
pub struct UnavailableIndexStore;

impl UnavailableIndexStore {
    fn failure() -> ApplicationError {
        ApplicationError::backend(StoreKind::Index, "connection refused")
    }
}

#[async_trait]
impl IndexStore for UnavailableIndexStore {
    async fn get(&self, _: &str, _: &EntityId) -> Result<Option<VersionedDocument>, ApplicationError> {
        Err(Self::failure())
    }
    async fn put(&self, _: &str, _: &EntityId, _: &IndexedDocument) -> Result<IndexReceipt, ApplicationError> {
        Err(Self::failure())
    }
    async fn put_if_version(
        &self,
        _: &str,
        _: &EntityId,
        _: &IndexedDocument,
        _: VersionToken,
    ) -> Result<IndexReceipt, ApplicationError> {
        Err(Self::failure())
    }
    async fn delete(&self, _: &str, _: &EntityId) -> Result<bool, ApplicationError> {
        Err(Self::failure())
    }
}

/// Index store that counts calls before delegating.
#[derive(Debug, Default)]
pub struct CountingIndexStore {
    pub inner: InMemoryIndexStore,
    pub calls: AtomicUsize,
}

impl CountingIndexStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl IndexStore for CountingIndexStore {
    async fn get(&self, index: &str, id: &EntityId) -> Result<Option<VersionedDocument>, ApplicationError> {
        self.tick();
        self.inner.get(index, id).await
    }
    async fn put(&self, index: &str, id: &EntityId, document: &IndexedDocument) -> Result<IndexReceipt, ApplicationError> {
        self.tick();
        self.inner.put(index, id, document).await
    }
    async fn put_if_version(
        &self,
        index: &str,
        id: &EntityId,
        document: &IndexedDocument,
        version: VersionToken,
    ) -> Result<IndexReceipt, ApplicationError> {
        self.tick();
        self.inner.put_if_version(index, id, document, version).await
    }
    async fn delete(&self, index: &str, id: &EntityId) -> Result<bool, ApplicationError> {
        self.tick();
        self.inner.delete(index, id).await
    }
}

/// Index store that sneaks a rival write in right after the next read, as if
/// another process won the race between read and conditional write.
#[derive(Debug, Default)]
pub struct RacingIndexStore {
    pub inner: InMemoryIndexStore,
    rival: Mutex<Option<IndexedDocument>>,
}

impl RacingIndexStore {
    pub fn arm(&self, rival: IndexedDocument) {
        *self.rival.lock().unwrap() = Some(rival);
    }
}

#[async_trait]
impl IndexStore for RacingIndexStore {
    async fn get(&self, index: &str, id: &EntityId) -> Result<Option<VersionedDocument>, ApplicationError> {
        let read = self.inner.get(index, id).await?;
        let rival = self.rival.lock().unwrap().take();
        if let Some(rival) = rival {
            self.inner.put(index, id, &rival).await?;
        }
        Ok(read)
    }
    async fn put(&self, index: &str, id: &EntityId, document: &IndexedDocument) -> Result<IndexReceipt, ApplicationError> {
        self.inner.put(index, id, document).await
    }
    async fn put_if_version(
        &self,
        index: &str,
        id: &EntityId,
        document: &IndexedDocument,
        version: VersionToken,
    ) -> Result<IndexReceipt, ApplicationError> {
        self.inner.put_if_version(index, id, document, version).await
    }
    async fn delete(&self, index: &str, id: &EntityId) -> Result<bool, ApplicationError> {
        self.inner.delete(index, id).await
    }
}

/// Index store that answers every call only after `delay`.
#[derive(Debug, Default)]
pub struct SlowIndexStore {
    pub inner: InMemoryIndexStore,
    pub delay: Duration,
}

#[async_trait]
impl IndexStore for SlowIndexStore {
    async fn get(&self, index: &str, id: &EntityId) -> Result<Option<VersionedDocument>, ApplicationError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(index, id).await
    }
    async fn put(&self, index: &str, id: &EntityId, document: &IndexedDocument) -> Result<IndexReceipt, ApplicationError> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(index, id, document).await
    }
    async fn put_if_version(
        &self,
        index: &str,
        id: &EntityId,
        document: &IndexedDocument,
        version: VersionToken,
    ) -> Result<IndexReceipt, ApplicationError> {
        tokio::time::sleep(self.delay).await;
        self.inner.put_if_version(index, id, document, version).await
    }
    async fn delete(&self, index: &str, id: &EntityId) -> Result<bool, ApplicationError> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(index, id).await
    }
}

/// Index store replicated over two shards where the replica on `node-b`
/// rejects every write. Writes still land on the primary shard.
#[derive(Debug, Default)]
pub struct PartialShardIndexStore {
    pub inner: InMemoryIndexStore,
}

impl PartialShardIndexStore {
    pub fn shards(index: &str) -> ShardInfo {
        ShardInfo {
            total: 2,
            successful: 1,
            failures: vec![ShardFailure {
                index: index.to_string(),
                shard_id: 1,
                node_id: Some("node-b".to_string()),
                reason: "replica disk full".to_string(),
                primary: false,
            }],
        }
    }

    fn degrade(index: &str, receipt: IndexReceipt) -> IndexReceipt {
        IndexReceipt {
            version: receipt.version,
            shards: Self::shards(index),
        }
    }
}

#[async_trait]
impl IndexStore for PartialShardIndexStore {
    async fn get(&self, index: &str, id: &EntityId) -> Result<Option<VersionedDocument>, ApplicationError> {
        self.inner.get(index, id).await
    }
    async fn put(&self, index: &str, id: &EntityId, document: &IndexedDocument) -> Result<IndexReceipt, ApplicationError> {
        let receipt = self.inner.put(index, id, document).await?;
        Ok(Self::degrade(index, receipt))
    }
    async fn put_if_version(
        &self,
        index: &str,
        id: &EntityId,
        document: &IndexedDocument,
        version: VersionToken,
    ) -> Result<IndexReceipt, ApplicationError> {
        let receipt = self.inner.put_if_version(index, id, document, version).await?;
        Ok(Self::degrade(index, receipt))
    }
    async fn delete(&self, index: &str, id: &EntityId) -> Result<bool, ApplicationError> {
        self.inner.delete(index, id).await
    }
}
