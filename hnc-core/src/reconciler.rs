//! One reconcile pass over a tree.
//!
//! A pass works on a fresh snapshot of the forest and runs the components
//! in a fixed order:
//!
//! 1. anchors: create declared subnamespaces, collect anchor deletions
//! 2. cascade: plan and execute deletions, topmost trigger first
//! 3. propagation: top-down over the (reloaded) tree
//! 4. conditions: recompute and write the delta
//!
//! The caller must hold the lock of the root being reconciled.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::anchor::{AnchorReconciler, AnchorReport};
use crate::cascade::{CascadeDeletePlanner, DeletionTrigger};
use crate::conditions::{ConditionDelta, ConditionManager};
use crate::config::HncConfig;
use crate::hierarchy::HierarchyStore;
use crate::propagation::PropagationEngine;
use crate::store::ObjectStore;
use crate::types::{Result, StoreError};

/// Result of reconciling one root.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Root the pass ran for
    pub root: String,
    /// Subnamespaces created
    pub created: Vec<String>,
    /// Namespaces deleted by cascading deletion
    pub deleted: Vec<String>,
    /// Copies written
    pub written: usize,
    /// Obsolete copies removed
    pub removed: usize,
    /// Conditions that changed
    pub condition_changes: Vec<ConditionDelta>,
    /// Keys whose trees must be reconciled as well
    pub requeue: BTreeSet<String>,
    /// Transient failures that require another pass
    pub transient: Vec<StoreError>,
}

impl PassReport {
    fn new(root: &str) -> Self {
        Self {
            root: root.to_string(),
            ..Default::default()
        }
    }

    /// Whether the pass left work behind.
    pub fn needs_retry(&self) -> bool {
        !self.transient.is_empty()
    }
}

/// Reconciler context.
///
/// Carries its own store handle; nothing is shared with other reconcilers
/// except through the store.
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    anchors: AnchorReconciler,
    cascade: CascadeDeletePlanner,
    propagation: PropagationEngine,
    conditions: ConditionManager,
    /// Parent of each namespace as of its last pass
    known_parents: DashMap<String, Option<String>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, config: &HncConfig) -> Self {
        Self {
            store,
            anchors: AnchorReconciler::new(),
            cascade: CascadeDeletePlanner::new(),
            propagation: PropagationEngine::new(config.propagation.clone()),
            conditions: ConditionManager::new(),
            known_parents: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Roots whose trees a change to `key` affects.
    ///
    /// Besides the current tree of `key`, this includes the tree `key` was
    /// last seen in (its old parent may carry stale conditions) and, when
    /// `key` no longer exists, the children it left behind.
    pub async fn resolve_roots(&self, key: &str) -> Result<BTreeSet<String>> {
        let forest = HierarchyStore::load(self.store.as_ref()).await?;
        Ok(self.roots_in(&forest, key))
    }

    /// Same as `resolve_roots` against an existing snapshot.
    pub fn roots_in(&self, forest: &HierarchyStore, key: &str) -> BTreeSet<String> {
        let mut roots = BTreeSet::new();

        if forest.contains(key) {
            roots.extend(forest.root_of(key));
        } else {
            for child in forest.children(key) {
                roots.extend(forest.root_of(&child));
            }
        }

        let current = forest.get(key).and_then(|node| node.parent.clone());
        if let Some(previous) = self.known_parents.get(key).map(|entry| entry.value().clone()) {
            if previous != current {
                if let Some(old_parent) = previous {
                    roots.extend(forest.root_of(&old_parent));
                }
            }
        }

        roots
    }

    /// Run one pass over the tree rooted at `root`.
    #[instrument(skip(self))]
    pub async fn reconcile_root(&self, root: &str) -> Result<PassReport> {
        let mut report = PassReport::new(root);
        let store = self.store.as_ref();
        let mut forest = HierarchyStore::load(store).await?;

        if !forest.contains(root) {
            debug!("Root no longer exists");
            report.requeue.extend(forest.children(root));
            self.known_parents.remove(root);
            return Ok(report);
        }
        if forest.root_of(root).as_deref() != Some(root) {
            // Re-parented since it was resolved; reconcile the new tree instead
            report.requeue.insert(root.to_string());
            return Ok(report);
        }

        let subtree = forest.subtree_top_down(root);
        let anchor_report = self.anchors.reconcile(store, &forest, &subtree).await?;
        report.created = anchor_report.created.clone();
        report.transient.extend(anchor_report.transient.iter().cloned());

        let mut triggers = self.cascade.namespace_triggers(&forest, &subtree);
        triggers.extend(anchor_report.deleted.iter().cloned().map(DeletionTrigger::Anchor));
        triggers.sort_by_key(|trigger| depth_of(&forest, trigger));

        let mut stale = !anchor_report.created.is_empty();
        for trigger in triggers {
            if stale {
                forest = HierarchyStore::load(store).await?;
                stale = false;
            }
            let plan = self.cascade.plan(&forest, trigger);
            let outcome = self.cascade.execute(store, &plan).await;

            if !outcome.deleted.is_empty() || outcome.anchor_finalized {
                stale = true;
                report.requeue.extend(plan.orphans.iter().cloned());
                report.deleted.extend(outcome.deleted.iter().cloned());
            }
            report.transient.extend(outcome.errors);
        }

        if stale {
            forest = HierarchyStore::load(store).await?;
        }
        if !forest.contains(root) {
            info!(deleted = report.deleted.len(), "Root deleted");
            report.requeue.extend(forest.children(root));
            for ns in &report.deleted {
                self.known_parents.remove(ns);
            }
            return Ok(report);
        }

        let subtree = forest.subtree_top_down(root);
        let propagation = self.propagation.propagate(store, &forest, &subtree).await?;
        report.written = propagation.written;
        report.removed = propagation.removed;
        report.transient.extend(propagation.transient.iter().cloned());

        let anchors = AnchorReport {
            missing_anchor: self.anchors.plan(&forest, &subtree).missing_anchor,
            ..Default::default()
        };
        let desired = self.conditions.compute(&forest, &subtree, &propagation, &anchors);
        report.condition_changes = self.conditions.apply(store, &forest, desired).await?;

        for ns in &report.deleted {
            self.known_parents.remove(ns);
        }
        for ns in &subtree {
            if let Some(node) = forest.get(ns) {
                self.known_parents.insert(ns.clone(), node.parent.clone());
            }
        }

        debug!(
            namespaces = subtree.len(),
            written = report.written,
            removed = report.removed,
            conditions = report.condition_changes.len(),
            "Pass complete"
        );
        Ok(report)
    }
}

/// Depth of the namespace a trigger deletes; unknown targets sort last.
fn depth_of(forest: &HierarchyStore, trigger: &DeletionTrigger) -> usize {
    match forest.ancestors(trigger.target()).len() {
        0 => usize::MAX,
        depth => depth,
    }
}
