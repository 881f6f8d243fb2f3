use serde::{Deserialize, Serialize}; // For permission/document (de)serialization
use serde_json::Value; // Index documents are JSON trees
use std::fmt;
use std::sync::Arc;
use thiserror::Error; // For domain-specific errors

/// Name of the reserved array field holding permission tokens on index documents.
pub const PERMISSIONS_FIELD: &str = "permissions";

// --- Domain Errors ---
#[derive(Error, Debug, PartialEq)]
pub enum DomainError {
    #[error("Unable to determine entity id of type {type_name}: identity accessor returned an empty value")]
    IdentityResolution { type_name: String },
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

// --- Entity ID ---
/// Identity shared by the primary record and its index document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}
impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}
impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Identity Resolution ---

/// Entity types that know their own identity field.
pub trait Identified {
    fn identity(&self) -> String;
}

/// Extracts the identity of an entity through an accessor registered up front.
pub struct IdentityResolver<T> {
    accessor: Arc<dyn Fn(&T) -> String + Send + Sync>,
}

impl<T> IdentityResolver<T> {
    pub fn new<F>(accessor: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        Self {
            accessor: Arc::new(accessor),
        }
    }

    /// Resolves the identity of `entity`. Empty or blank ids are rejected.
    pub fn resolve(&self, entity: &T) -> Result<EntityId, DomainError> {
        let id = (self.accessor)(entity);
        if id.trim().is_empty() {
            return Err(DomainError::IdentityResolution {
                type_name: std::any::type_name::<T>().to_string(),
            });
        }
        Ok(EntityId::new(id))
    }
}

impl<T: Identified + 'static> IdentityResolver<T> {
    /// Resolver backed by the type's own [`Identified`] impl.
    pub fn identified() -> Self {
        Self::new(|entity: &T| entity.identity())
    }
}

impl<T> Clone for IdentityResolver<T> {
    fn clone(&self) -> Self {
        Self {
            accessor: Arc::clone(&self.accessor),
        }
    }
}

impl<T> fmt::Debug for IdentityResolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("entity", &std::any::type_name::<T>())
            .finish()
    }
}

// --- Permission Model ---

/// An access grant of `action` to `subject`, scoped to one indexed resource.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")] // permissionId, resourceId, resourceType in JSON
pub struct Permission {
    pub permission_id: Option<String>,
    pub subject: String,
    pub resource_id: Option<String>,
    pub resource_type: Option<String>,
    pub action: String,
}

impl Permission {
    pub fn new(subject: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            action: action.into(),
            ..Self::default()
        }
    }

    pub fn on_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    /// The document this permission targets, if a non-blank resource id is set.
    pub fn target(&self) -> Option<EntityId> {
        self.resource_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map(EntityId::from)
    }

    pub fn token(&self) -> PermissionToken {
        PermissionToken::new(&self.subject, &self.action)
    }
}

/// The `"subject:action"` projection stored in a document's permission array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionToken(String);

impl PermissionToken {
    pub fn new(subject: &str, action: &str) -> Self {
        Self(format!("{}:{}", subject, action))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    pub fn into_inner(self) -> String {
        self.0
    }
}
impl fmt::Display for PermissionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Versioning ---

/// Revision marker handed out by the index store on every read and write.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionToken {
    pub seq_no: u64,
    pub primary_term: u64,
}

impl VersionToken {
    pub fn new(seq_no: u64, primary_term: u64) -> Self {
        Self {
            seq_no,
            primary_term,
        }
    }
}
impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq_no={} primary_term={}", self.seq_no, self.primary_term)
    }
}

// --- Indexed Document ---

/// Denormalized index copy of an entity: its JSON fields plus a `permissions` array.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct IndexedDocument(Value);

impl IndexedDocument {
    /// Serializes an entity into a document. The entity must serialize to a JSON
    /// object; any `permissions` field it carries is dropped.
    pub fn from_entity<T: Serialize>(entity: &T) -> Result<Self, DomainError> {
        let value = serde_json::to_value(entity)
            .map_err(|e| DomainError::InvalidDocument(e.to_string()))?;
        match value {
            Value::Object(mut fields) => {
                fields.remove(PERMISSIONS_FIELD);
                Ok(Self(Value::Object(fields)))
            }
            other => Err(DomainError::InvalidDocument(format!(
                "entity must serialize to a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Wraps a document as read back from an index backend, whatever its shape.
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn get_field_value(&self, field_name: &str) -> Option<&Value> {
        self.0.get(field_name)
    }

    /// Textual entries of the permission array, in stored order.
    pub fn permissions(&self) -> Vec<&str> {
        self.0
            .get(PERMISSIONS_FIELD)
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Appends one token per permission, in order. Duplicates are kept.
    pub fn attach_permissions(&mut self, permissions: &[Permission]) {
        if let Some(entries) = self.permissions_mut() {
            entries.extend(
                permissions
                    .iter()
                    .map(|permission| Value::String(permission.token().into_inner())),
            );
        }
    }

    /// Replaces this document's permission array with the one from `previous`.
    /// Does nothing unless both documents are JSON objects.
    pub fn carry_forward_permissions(&mut self, previous: &IndexedDocument) {
        let (Some(fields), Some(previous_fields)) =
            (self.0.as_object_mut(), previous.0.as_object())
        else {
            return;
        };
        let carried = previous_fields
            .get(PERMISSIONS_FIELD)
            .filter(|value| value.is_array())
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        fields.insert(PERMISSIONS_FIELD.to_string(), carried);
    }

    /// Appends `token` without checking for an identical entry.
    pub fn add_permission_token(&mut self, token: &PermissionToken) {
        if let Some(entries) = self.permissions_mut() {
            entries.push(Value::String(token.as_str().to_string()));
        }
    }

    /// Removes every entry equal to `token` and returns how many were removed.
    pub fn remove_permission_token(&mut self, token: &PermissionToken) -> usize {
        let Some(entries) = self.permissions_mut() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|entry| entry.as_str() != Some(token.as_str()));
        before - entries.len()
    }

    // Object documents always get an array slot; a non-array value under the
    // reserved key is replaced.
    fn permissions_mut(&mut self) -> Option<&mut Vec<Value>> {
        let fields = self.0.as_object_mut()?;
        let slot = fields
            .entry(PERMISSIONS_FIELD)
            .or_insert_with(|| Value::Array(Vec::new()));
        if !slot.is_array() {
            *slot = Value::Array(Vec::new());
        }
        slot.as_array_mut()
    }
}

/// An index document together with the version it was read at.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VersionedDocument {
    pub document: IndexedDocument,
    pub version: VersionToken,
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
