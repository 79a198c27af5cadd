//! Reconciles subnamespace anchors against the namespaces they declare.
//!
//! An anchor in a parent is the authority for whether the named child
//! exists. Three situations are distinguished:
//!
//! - a live anchor whose child is absent: the child is created
//! - an anchored child whose parent holds no anchor: the child is flagged
//!   with `SubnamespaceAnchorMissing` and is never deleted for it
//! - a terminating anchor: an explicit deletion event, handed to the
//!   cascade planner

use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::hierarchy::HierarchyStore;
use crate::store::ObjectStore;
use crate::types::{Anchor, AnchorState, HierarchyRecord, Result, StoreError};

/// What the anchor reconciler intends to do for a subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnchorPlan {
    /// Anchored namespaces whose parent holds no anchor for them
    pub missing_anchor: BTreeSet<String>,
    /// Live anchors whose subnamespace must be created
    pub to_create: Vec<Anchor>,
    /// Anchors whose recorded state is stale
    pub state_updates: Vec<(Anchor, AnchorState)>,
    /// Anchors the user deleted
    pub deleted: Vec<Anchor>,
}

/// Result of reconciling anchors.
#[derive(Debug, Clone, Default)]
pub struct AnchorReport {
    /// Anchored namespaces whose parent holds no anchor for them
    pub missing_anchor: BTreeSet<String>,
    /// Subnamespaces created in this pass
    pub created: Vec<String>,
    /// Anchors in conflict with an existing namespace
    pub conflicts: Vec<Anchor>,
    /// Anchor deletions to route to the cascade planner
    pub deleted: Vec<Anchor>,
    /// Transient failures; the key must be retried
    pub transient: Vec<StoreError>,
}

/// Anchor reconciler.
#[derive(Debug, Default)]
pub struct AnchorReconciler;

impl AnchorReconciler {
    pub fn new() -> Self {
        Self
    }

    /// Compare anchors held by, and declared by, the namespaces in `subtree`.
    pub fn plan(&self, forest: &HierarchyStore, subtree: &[String]) -> AnchorPlan {
        let mut plan = AnchorPlan::default();

        for ns in subtree {
            let Some(node) = forest.get(ns) else {
                continue;
            };

            if node.is_anchored_subnamespace {
                let declared = match node.parent.as_deref() {
                    Some(parent) => forest.anchor(parent, ns).is_some(),
                    None => false,
                };
                if !declared {
                    plan.missing_anchor.insert(ns.clone());
                }
            }

            for anchor in forest.anchors_in(ns) {
                if anchor.terminating {
                    plan.deleted.push(anchor.clone());
                    continue;
                }

                let desired = match forest.get(&anchor.name) {
                    None if node.terminating => continue,
                    None => {
                        plan.to_create.push(anchor.clone());
                        AnchorState::Ok
                    }
                    Some(child)
                        if child.is_anchored_subnamespace
                            && child.parent.as_deref() == Some(ns.as_str()) =>
                    {
                        AnchorState::Ok
                    }
                    Some(_) => AnchorState::Conflict,
                };

                if anchor.state != desired {
                    plan.state_updates.push((anchor.clone(), desired));
                }
            }
        }

        plan
    }

    /// Apply the plan: create missing subnamespaces and record anchor states.
    pub async fn reconcile(
        &self,
        store: &dyn ObjectStore,
        forest: &HierarchyStore,
        subtree: &[String],
    ) -> Result<AnchorReport> {
        let plan = self.plan(forest, subtree);
        let mut report = AnchorReport {
            missing_anchor: plan.missing_anchor,
            deleted: plan.deleted,
            ..Default::default()
        };

        for name in &report.missing_anchor {
            debug!(namespace = %name, "Subnamespace anchor missing");
        }

        let mut failed = BTreeSet::new();
        for anchor in &plan.to_create {
            let record = HierarchyRecord {
                parent: Some(anchor.namespace.clone()),
                is_anchored_subnamespace: true,
                ..Default::default()
            };
            match store.create_namespace(&anchor.name, record).await {
                Ok(_) => {
                    info!(parent = %anchor.namespace, subnamespace = %anchor.name, "Created subnamespace");
                    report.created.push(anchor.name.clone());
                }
                Err(e) => {
                    warn!(parent = %anchor.namespace, subnamespace = %anchor.name, error = %e, "Failed to create subnamespace");
                    failed.insert((anchor.namespace.clone(), anchor.name.clone()));
                    report.transient.push(e);
                }
            }
        }

        for (anchor, state) in plan.state_updates {
            if failed.contains(&(anchor.namespace.clone(), anchor.name.clone())) {
                continue;
            }
            if state == AnchorState::Conflict {
                warn!(parent = %anchor.namespace, name = %anchor.name, "Anchor conflicts with an existing namespace");
                report.conflicts.push(anchor.clone());
            }
            match store.update_anchor_state(&anchor.namespace, &anchor.name, state).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => report.transient.push(e),
            }
        }

        Ok(report)
    }
}
