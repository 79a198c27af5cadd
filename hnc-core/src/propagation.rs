//! Top-down propagation of policy objects into descendant namespaces.
//!
//! Namespaces are visited strictly by depth. When a namespace is visited,
//! the set of source objects it exposes to its children (its own native
//! objects layered over everything its parent exposes) is finalized before
//! any child is processed, so propagation composes through any number of
//! levels. Each copy carries the fingerprint of its source; a copy is
//! rewritten only when that fingerprint or its origin changes, which keeps
//! repeated passes free of writes.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::PropagationConfig;
use crate::hierarchy::HierarchyStore;
use crate::store::ObjectStore;
use crate::types::{Object, ObjectKey, Result, StoreError};

/// Outcome of materializing one copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    /// The target holds an up-to-date copy
    Applied,
    /// The store refused the copy, or a native object occupies its name
    Blocked,
    /// A transient failure occurred; the pass will be retried
    Pending,
}

/// One materialized (or attempted) copy of a source object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagatedObject {
    /// Namespace holding the source object
    pub source_namespace: String,
    /// Kind and name of the object
    pub key: ObjectKey,
    /// Namespace receiving the copy
    pub target_namespace: String,
    /// Fingerprint of the source object
    pub origin_hash: String,
    /// Result of this pass
    pub status: CopyStatus,
    /// Why the copy is blocked
    pub reason: Option<String>,
}

/// An obsolete copy that could not be removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedRemoval {
    /// Namespace holding the stale copy
    pub target_namespace: String,
    /// Kind and name of the copy
    pub key: ObjectKey,
    /// Store's refusal
    pub reason: String,
}

/// Result of a propagation run over a subtree.
#[derive(Debug, Clone, Default)]
pub struct PropagationReport {
    /// Every copy the subtree should hold, with its status
    pub copies: Vec<PropagatedObject>,
    /// Stale copies the store refused to delete
    pub blocked_removals: Vec<BlockedRemoval>,
    /// Namespaces skipped because their ancestry is broken
    pub frozen: Vec<String>,
    /// Copies written (created or updated) in this run
    pub written: usize,
    /// Stale copies removed in this run
    pub removed: usize,
    /// Transient failures; the key must be retried
    pub transient: Vec<StoreError>,
}

impl PropagationReport {
    /// Copies that are blocked.
    pub fn blocked(&self) -> impl Iterator<Item = &PropagatedObject> {
        self.copies.iter().filter(|c| c.status == CopyStatus::Blocked)
    }
}

/// Propagation engine.
pub struct PropagationEngine {
    config: PropagationConfig,
}

impl PropagationEngine {
    pub fn new(config: PropagationConfig) -> Self {
        Self { config }
    }

    /// Propagate objects over `order`, which must be top-down by depth.
    pub async fn propagate(
        &self,
        store: &dyn ObjectStore,
        forest: &HierarchyStore,
        order: &[String],
    ) -> Result<PropagationReport> {
        let mut report = PropagationReport::default();
        // Source objects each visited namespace exposes to its children
        let mut exposed: HashMap<String, BTreeMap<ObjectKey, Object>> = HashMap::new();
        // Namespaces deleted since the snapshot was taken, and everything below them
        let mut severed: HashSet<String> = HashSet::new();

        for ns in order {
            if forest.parent_of(ns).is_some_and(|parent| severed.contains(parent)) {
                debug!(namespace = %ns, "Ancestor vanished, propagation suspended");
                report.frozen.push(ns.clone());
                severed.insert(ns.clone());
                continue;
            }

            let objects = match store.list_objects(ns).await {
                Ok(objects) => objects,
                Err(StoreError::NotFound(_)) => {
                    debug!(namespace = %ns, "Namespace vanished during propagation");
                    severed.insert(ns.clone());
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let mut natives = BTreeMap::new();
            let mut copies = BTreeMap::new();
            for object in objects {
                if object.is_copy() {
                    copies.insert(object.key(), object);
                } else if self.config.propagates(&object.kind) {
                    natives.insert(object.key(), object);
                }
            }

            let inherited = forest
                .parent_of(ns)
                .and_then(|parent| exposed.get(parent))
                .cloned()
                .unwrap_or_default();

            if forest.is_orphan(ns) || forest.has_broken_ancestry(ns) {
                debug!(namespace = %ns, "Ancestry broken, propagation suspended");
                report.frozen.push(ns.clone());
            } else {
                self.sync_namespace(store, ns, &inherited, &natives, &copies, &mut report)
                    .await;
            }

            let mut visible = inherited;
            visible.extend(natives);
            exposed.insert(ns.clone(), visible);
        }

        if report.written > 0 || report.removed > 0 {
            info!(
                written = report.written,
                removed = report.removed,
                blocked = report.blocked().count(),
                "Propagation applied changes"
            );
        }

        Ok(report)
    }

    /// Bring the copies held by `ns` in line with what its parent exposes.
    async fn sync_namespace(
        &self,
        store: &dyn ObjectStore,
        ns: &str,
        inherited: &BTreeMap<ObjectKey, Object>,
        natives: &BTreeMap<ObjectKey, Object>,
        copies: &BTreeMap<ObjectKey, Object>,
        report: &mut PropagationReport,
    ) {
        for (key, source) in inherited {
            let origin_hash = source.content_hash();
            let mut outcome = PropagatedObject {
                source_namespace: source.namespace.clone(),
                key: key.clone(),
                target_namespace: ns.to_string(),
                origin_hash: origin_hash.clone(),
                status: CopyStatus::Applied,
                reason: None,
            };

            if natives.contains_key(key) {
                outcome.status = CopyStatus::Blocked;
                outcome.reason = Some(format!("{ns} holds its own {key}"));
                report.copies.push(outcome);
                continue;
            }

            let write = match copies.get(key) {
                Some(copy)
                    if copy.origin_hash.as_deref() == Some(origin_hash.as_str())
                        && copy.inherited_from.as_deref() == Some(source.namespace.as_str()) =>
                {
                    None
                }
                Some(_) => Some(store.update_object(source.copy_into(ns)).await),
                None => Some(store.create_object(source.copy_into(ns)).await),
            };

            match write {
                None => {}
                Some(Ok(())) => {
                    debug!(source = %source.namespace, target = %ns, object = %key, "Copy written");
                    report.written += 1;
                }
                Some(Err(StoreError::PermissionDenied(reason))) => {
                    warn!(source = %source.namespace, target = %ns, object = %key, "Copy refused by store");
                    outcome.status = CopyStatus::Blocked;
                    outcome.reason = Some(reason);
                }
                Some(Err(e)) => {
                    outcome.status = CopyStatus::Pending;
                    report.transient.push(e);
                }
            }
            report.copies.push(outcome);
        }

        for (key, copy) in copies {
            if inherited.contains_key(key) {
                continue;
            }
            match store.delete_object(ns, key).await {
                Ok(()) => {
                    debug!(namespace = %ns, object = %key, from = ?copy.inherited_from, "Obsolete copy removed");
                    report.removed += 1;
                }
                Err(StoreError::NotFound(_)) => {}
                Err(StoreError::PermissionDenied(reason)) => {
                    report.blocked_removals.push(BlockedRemoval {
                        target_namespace: ns.to_string(),
                        key: key.clone(),
                        reason,
                    });
                }
                Err(e) => report.transient.push(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn setup(edges: &[(&str, Option<&str>)]) -> (MemoryStore, HierarchyStore) {
        let store = MemoryStore::new();
        let mut forest = HierarchyStore::new();
        for (name, parent) in edges {
            store.create_namespace(name, Default::default()).await.unwrap();
            forest.upsert_namespace(name, *parent).unwrap();
        }
        (store, forest)
    }

    fn engine() -> PropagationEngine {
        PropagationEngine::new(PropagationConfig::default())
    }

    fn role(ns: &str, name: &str) -> Object {
        Object::new(ns, "Role", name, serde_json::json!({"verbs": ["get"]}))
    }

    #[tokio::test]
    async fn test_propagates_through_levels() {
        let (store, forest) = setup(&[("a", None), ("b", Some("a")), ("c", Some("b"))]).await;
        store.create_object(role("a", "reader")).await.unwrap();

        let order = forest.subtree_top_down("a");
        let report = engine().propagate(&store, &forest, &order).await.unwrap();

        assert_eq!(report.written, 2);
        let copy = store.get_object("c", &ObjectKey::new("Role", "reader")).await.unwrap();
        assert_eq!(copy.inherited_from.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_second_run_writes_nothing() {
        let (store, forest) = setup(&[("a", None), ("b", Some("a"))]).await;
        store.create_object(role("a", "reader")).await.unwrap();
        let order = forest.subtree_top_down("a");

        let first = engine().propagate(&store, &forest, &order).await.unwrap();
        let writes = store.write_count();
        let second = engine().propagate(&store, &forest, &order).await.unwrap();

        assert_eq!(store.write_count(), writes);
        assert_eq!(first.copies, second.copies);
        assert_eq!(second.written, 0);
    }

    #[tokio::test]
    async fn test_ignores_unconfigured_kinds() {
        let (store, forest) = setup(&[("a", None), ("b", Some("a"))]).await;
        store
            .create_object(Object::new("a", "ConfigMap", "settings", serde_json::json!({})))
            .await
            .unwrap();

        let order = forest.subtree_top_down("a");
        let report = engine().propagate(&store, &forest, &order).await.unwrap();

        assert!(report.copies.is_empty());
        assert!(store.list_objects("b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_source_change_updates_copy() {
        let (store, forest) = setup(&[("a", None), ("b", Some("a"))]).await;
        let mut source = role("a", "reader");
        store.create_object(source.clone()).await.unwrap();
        let order = forest.subtree_top_down("a");
        engine().propagate(&store, &forest, &order).await.unwrap();

        source.spec = serde_json::json!({"verbs": ["get", "list"]});
        store.update_object(source.clone()).await.unwrap();
        engine().propagate(&store, &forest, &order).await.unwrap();

        let copy = store.get_object("b", &source.key()).await.unwrap();
        assert_eq!(copy.spec, source.spec);
        assert_eq!(copy.origin_hash, Some(source.content_hash()));
    }

    #[tokio::test]
    async fn test_deleted_source_removes_copies() {
        let (store, forest) = setup(&[("a", None), ("b", Some("a")), ("c", Some("b"))]).await;
        let source = role("a", "reader");
        store.create_object(source.clone()).await.unwrap();
        let order = forest.subtree_top_down("a");
        engine().propagate(&store, &forest, &order).await.unwrap();

        store.delete_object("a", &source.key()).await.unwrap();
        let report = engine().propagate(&store, &forest, &order).await.unwrap();

        assert_eq!(report.removed, 2);
        assert!(store.list_objects("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_permission_denied_is_blocked() {
        let (store, forest) = setup(&[("a", None), ("b", Some("a")), ("c", Some("b"))]).await;
        store.deny_privilege("cluster-admin").await;
        store
            .create_object(
                Object::new("a", "RoleBinding", "admins", serde_json::json!({}))
                    .with_privilege("cluster-admin"),
            )
            .await
            .unwrap();

        let order = forest.subtree_top_down("a");
        let report = engine().propagate(&store, &forest, &order).await.unwrap();

        let blocked: Vec<_> = report.blocked().map(|c| c.target_namespace.as_str()).collect();
        assert_eq!(blocked, vec!["b", "c"]);
        assert!(report.blocked().all(|c| c.source_namespace == "a"));
        assert!(report.transient.is_empty());
    }

    #[tokio::test]
    async fn test_native_object_is_never_overwritten() {
        let (store, forest) = setup(&[("a", None), ("b", Some("a")), ("c", Some("b"))]).await;
        store.create_object(role("a", "reader")).await.unwrap();
        let own = Object::new("b", "Role", "reader", serde_json::json!({"verbs": ["*"]}));
        store.create_object(own.clone()).await.unwrap();

        let order = forest.subtree_top_down("a");
        let report = engine().propagate(&store, &forest, &order).await.unwrap();

        assert_eq!(store.get_object("b", &own.key()).await.unwrap(), own);
        let blocked: Vec<_> = report.blocked().collect();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].target_namespace, "b");

        // Nearest ancestor wins below the collision
        let copy = store.get_object("c", &own.key()).await.unwrap();
        assert_eq!(copy.inherited_from.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_orphaned_branch_is_frozen() {
        let (store, mut forest) = setup(&[("a", None), ("b", Some("a")), ("c", Some("b"))]).await;
        store.create_object(role("a", "reader")).await.unwrap();
        let order = forest.subtree_top_down("a");
        engine().propagate(&store, &forest, &order).await.unwrap();

        forest.remove_namespace("a");
        let order = forest.subtree_top_down("b");
        let report = engine().propagate(&store, &forest, &order).await.unwrap();

        assert_eq!(report.frozen, vec!["b", "c"]);
        assert_eq!(report.removed, 0);
        assert_eq!(store.list_objects("c").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_namespace_deleted_after_snapshot_freezes_descendants() {
        let (store, forest) = setup(&[
            ("a", None),
            ("mid", Some("a")),
            ("leaf", Some("mid")),
            ("leaf-child", Some("leaf")),
        ])
        .await;
        let source = role("a", "reader");
        store.create_object(source.clone()).await.unwrap();
        let order = forest.subtree_top_down("a");
        engine().propagate(&store, &forest, &order).await.unwrap();

        // The snapshot still parents leaf under mid
        store.delete_namespace("mid").await.unwrap();
        let report = engine().propagate(&store, &forest, &order).await.unwrap();

        assert_eq!(report.frozen, vec!["leaf", "leaf-child"]);
        assert_eq!(report.removed, 0);
        assert!(store.get_object("leaf", &source.key()).await.is_ok());
        assert!(store.get_object("leaf-child", &source.key()).await.is_ok());
    }
}
