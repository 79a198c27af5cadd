//! Core types for the hierarchy engine.
//!
//! These types model the records persisted by the external object store:
//! namespaces, subnamespace anchors, propagatable objects and the
//! per-namespace hierarchy status document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Kind of diagnostic condition attached to a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConditionKind {
    /// An object in this namespace could not be copied to a descendant
    CannotPropagateObject,
    /// A copy in this namespace could not be created, updated or removed
    CannotUpdateObject,
    /// This namespace claims to be a subnamespace but its parent holds no anchor
    SubnamespaceAnchorMissing,
    /// The parent named in this namespace's hierarchy record does not exist
    CritParentMissing,
    /// Some ancestor of this namespace has a broken ancestry
    CritAncestor,
}

impl ConditionKind {
    /// Get string representation used in views and status documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CannotPropagateObject => "CannotPropagateObject",
            Self::CannotUpdateObject => "CannotUpdateObject",
            Self::SubnamespaceAnchorMissing => "SubnamespaceAnchorMissing",
            Self::CritParentMissing => "CritParentMissing",
            Self::CritAncestor => "CritAncestor",
        }
    }

    /// Crit conditions block propagation into the affected branch.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::CritParentMissing | Self::CritAncestor)
    }
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A diagnostic condition.
///
/// The owning namespace is implied by the record the condition lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Condition {
    /// Condition kind
    pub kind: ConditionKind,
    /// Object or namespace the condition is about, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Human-readable explanation
    pub message: String,
}

impl Condition {
    /// Create a condition without a subject.
    pub fn new(kind: ConditionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: None,
            message: message.into(),
        }
    }

    /// Builder: set the subject reference.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// Per-namespace hierarchy status document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyRecord {
    /// Parent namespace name, absent for roots
    #[serde(default)]
    pub parent: Option<String>,
    /// Whether an anchor in the parent governs this namespace's existence
    #[serde(default)]
    pub is_anchored_subnamespace: bool,
    /// Opt-in for cascading deletion of anchored descendants
    #[serde(default)]
    pub allow_cascading_delete: bool,
    /// Conditions written by the last reconcile pass
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A namespace as seen in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Unique name
    pub name: String,
    /// Store-assigned identifier
    pub uid: String,
    /// When the namespace was created
    pub created_at: DateTime<Utc>,
    /// Deletion has been requested but not finalized
    #[serde(default)]
    pub terminating: bool,
}

impl Namespace {
    /// Create a new, live namespace.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            terminating: false,
        }
    }
}

/// Reconciliation state of a subnamespace anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorState {
    /// The subnamespace has not been created yet
    #[default]
    Missing,
    /// The subnamespace exists and is governed by this anchor
    Ok,
    /// A namespace with this name exists but belongs elsewhere
    Conflict,
}

/// Declaration in a parent namespace that it owns a named subnamespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    /// Namespace holding the anchor (the parent)
    pub namespace: String,
    /// Name of the declared subnamespace
    pub name: String,
    /// Last state written by the anchor reconciler
    #[serde(default)]
    pub state: AnchorState,
    /// Deletion has been requested but not finalized
    #[serde(default)]
    pub terminating: bool,
}

impl Anchor {
    /// Create a new anchor for `name` inside `namespace`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            state: AnchorState::Missing,
            terminating: false,
        }
    }
}

/// Identity of an object within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Object kind (e.g. `RoleBinding`)
    pub kind: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A policy object that may be propagated to descendants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    /// Object kind
    pub kind: String,
    /// Object name
    pub name: String,
    /// Namespace holding this object
    pub namespace: String,
    /// Arbitrary object content
    #[serde(default)]
    pub spec: serde_json::Value,
    /// Privilege a holder of this object is granted (e.g. a cluster role)
    #[serde(default)]
    pub privilege: Option<String>,
    /// Source namespace when this object is a propagated copy
    #[serde(default)]
    pub inherited_from: Option<String>,
    /// Fingerprint of the source object this copy was made from
    #[serde(default)]
    pub origin_hash: Option<String>,
}

impl Object {
    /// Create a native (non-propagated) object.
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        spec: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
            spec,
            privilege: None,
            inherited_from: None,
            origin_hash: None,
        }
    }

    /// Builder: set the privilege this object grants.
    pub fn with_privilege(mut self, privilege: impl Into<String>) -> Self {
        self.privilege = Some(privilege.into());
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.kind, &self.name)
    }

    /// Whether this object is a copy made by propagation.
    pub fn is_copy(&self) -> bool {
        self.inherited_from.is_some()
    }

    /// Content fingerprint over everything a copy must reproduce.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.spec.to_string().as_bytes());
        hasher.update([0u8]);
        if let Some(privilege) = &self.privilege {
            hasher.update(privilege.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Build the copy of this source object that belongs in `target`.
    pub fn copy_into(&self, target: &str) -> Self {
        Self {
            kind: self.kind.clone(),
            name: self.name.clone(),
            namespace: target.to_string(),
            spec: self.spec.clone(),
            privilege: self.privilege.clone(),
            inherited_from: Some(self.namespace.clone()),
            origin_hash: Some(self.content_hash()),
        }
    }
}

/// Change notification emitted by the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A namespace was created, marked terminating or deleted
    Namespace { name: String },
    /// A namespace's hierarchy record changed
    Hierarchy { namespace: String },
    /// An anchor was created, marked terminating, updated or deleted
    Anchor { namespace: String, name: String },
    /// A propagatable object changed
    Object { namespace: String, key: ObjectKey },
}

impl StoreEvent {
    /// Namespace whose subtree must be reconciled after this event.
    pub fn affected_namespace(&self) -> &str {
        match self {
            Self::Namespace { name } => name,
            Self::Hierarchy { namespace } => namespace,
            Self::Anchor { namespace, .. } => namespace,
            Self::Object { namespace, .. } => namespace,
        }
    }
}

/// Error outcomes of the external object store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The controller is not allowed to perform the write
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Concurrent modification or already-exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The addressed record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient failures are retried by re-enqueueing the key.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Unavailable(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Error types for hierarchy operations.
#[derive(Debug, thiserror::Error)]
pub enum HncError {
    /// Setting the parent would make the namespace its own ancestor
    #[error("Cannot set parent of {namespace} to {parent}: would create a cycle")]
    Cycle { namespace: String, parent: String },

    /// Namespace or anchor does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input to a command
    #[error("Invalid argument: {0}")]
    Invalid(String),

    /// Store operation failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HncError {
    /// Whether the operation should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }

    /// Result code of the command surface.
    ///
    /// 0 is reserved for success.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Cycle { .. } | Self::Invalid(_) | Self::Config(_) => 1,
            Self::NotFound(_) | Self::Store(StoreError::NotFound(_)) => 2,
            Self::Store(_) => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, HncError>;
