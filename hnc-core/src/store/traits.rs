//! Core trait for the external object store.
//!
//! This module defines the `ObjectStore` trait - the boundary between the
//! reconciliation engine and whatever persists namespaces, anchors,
//! propagatable objects and hierarchy status records.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::types::{
    Anchor, AnchorState, HierarchyRecord, Namespace, Object, ObjectKey, StoreEvent, StoreResult,
};

/// Client interface to the object store.
///
/// All calls are synchronous from the engine's point of view: a pass awaits
/// each call before moving on. Any call may fail with a transient outcome
/// (`Conflict`, `Unavailable`); writes of propagated copies may also fail
/// with `PermissionDenied`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List all namespaces, including terminating ones.
    async fn list_namespaces(&self) -> StoreResult<Vec<Namespace>>;

    /// Get a single namespace.
    async fn get_namespace(&self, name: &str) -> StoreResult<Namespace>;

    /// Create a namespace together with its initial hierarchy record.
    ///
    /// Fails with `Conflict` if it already exists.
    async fn create_namespace(&self, name: &str, record: HierarchyRecord)
        -> StoreResult<Namespace>;

    /// Request deletion: the namespace becomes terminating.
    async fn mark_namespace_deleting(&self, name: &str) -> StoreResult<()>;

    /// Finalize deletion of a namespace and everything inside it.
    async fn delete_namespace(&self, name: &str) -> StoreResult<()>;

    /// Read the hierarchy record of a namespace (default if never written).
    async fn get_hierarchy(&self, namespace: &str) -> StoreResult<HierarchyRecord>;

    /// Replace the hierarchy record of a namespace.
    async fn put_hierarchy(&self, namespace: &str, record: HierarchyRecord) -> StoreResult<()>;

    /// List the anchors held by a namespace.
    async fn list_anchors(&self, namespace: &str) -> StoreResult<Vec<Anchor>>;

    /// Create an anchor for `name` in `namespace`.
    async fn create_anchor(&self, namespace: &str, name: &str) -> StoreResult<Anchor>;

    /// Request deletion of an anchor: it becomes terminating.
    async fn mark_anchor_deleting(&self, namespace: &str, name: &str) -> StoreResult<()>;

    /// Finalize deletion of an anchor.
    async fn delete_anchor(&self, namespace: &str, name: &str) -> StoreResult<()>;

    /// Record the reconciliation state of an anchor.
    async fn update_anchor_state(
        &self,
        namespace: &str,
        name: &str,
        state: AnchorState,
    ) -> StoreResult<()>;

    /// List the objects held by a namespace.
    async fn list_objects(&self, namespace: &str) -> StoreResult<Vec<Object>>;

    /// Get a single object.
    async fn get_object(&self, namespace: &str, key: &ObjectKey) -> StoreResult<Object>;

    /// Create an object. Fails with `Conflict` if it already exists.
    async fn create_object(&self, object: Object) -> StoreResult<()>;

    /// Replace an existing object.
    async fn update_object(&self, object: Object) -> StoreResult<()>;

    /// Delete an object.
    async fn delete_object(&self, namespace: &str, key: &ObjectKey) -> StoreResult<()>;

    /// Subscribe to change notifications.
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;
}
