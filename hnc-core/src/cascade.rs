//! Cascading deletion planning.
//!
//! When a namespace is deleted, or the anchor governing a subnamespace is
//! deleted, the planner computes exactly which namespaces go with it:
//!
//! 1. The deleted node T is always in the closure.
//! 2. Without the cascading-delete opt-in, none of T's descendants are;
//!    T's children are orphaned instead.
//! 3. With the opt-in (set on T or inherited down the anchored chain), the
//!    walk includes every anchored subnamespace below T, recursively, and
//!    stops at any namespace that was created directly and merely linked to
//!    its parent. Those are orphaned, never deleted.
//!
//! Deletion runs deepest first and T last, so a partial failure leaves the
//! remaining closure still attached to T, which stays terminating and is
//! planned again on the next pass.

use std::cmp::Reverse;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::hierarchy::HierarchyStore;
use crate::store::ObjectStore;
use crate::types::{Anchor, StoreError};

/// Event that starts a cascading deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionTrigger {
    /// A namespace was marked for deletion
    Namespace(String),
    /// An anchor was marked for deletion
    Anchor(Anchor),
}

impl DeletionTrigger {
    /// Namespace whose deletion this trigger requests, if any.
    pub fn target(&self) -> &str {
        match self {
            Self::Namespace(name) => name,
            Self::Anchor(anchor) => &anchor.name,
        }
    }
}

/// Deletion closure for one trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionPlan {
    /// What started the deletion
    pub trigger: DeletionTrigger,
    /// Namespaces to delete, deepest first, the trigger's target last
    pub closure: Vec<String>,
    /// Namespaces left behind without a parent
    pub orphans: Vec<String>,
    /// Descendants of orphans whose ancestry becomes broken
    pub broken_ancestry: Vec<String>,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Default)]
pub struct CascadeOutcome {
    /// Namespaces whose deletion was confirmed
    pub deleted: Vec<String>,
    /// Namespaces still to delete on a later pass
    pub remaining: Vec<String>,
    /// Whether the triggering anchor was finalized
    pub anchor_finalized: bool,
    /// Failures that stopped execution
    pub errors: Vec<StoreError>,
}

impl CascadeOutcome {
    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty() && self.errors.is_empty()
    }
}

/// Cascade delete planner.
#[derive(Debug, Default)]
pub struct CascadeDeletePlanner;

impl CascadeDeletePlanner {
    pub fn new() -> Self {
        Self
    }

    /// Deletion triggers raised by terminating namespaces in `subtree`,
    /// topmost first.
    pub fn namespace_triggers(&self, forest: &HierarchyStore, subtree: &[String]) -> Vec<DeletionTrigger> {
        subtree
            .iter()
            .filter(|ns| forest.get(ns).is_some_and(|node| node.terminating))
            .map(|ns| DeletionTrigger::Namespace(ns.clone()))
            .collect()
    }

    /// Compute the deletion closure for a trigger.
    pub fn plan(&self, forest: &HierarchyStore, trigger: DeletionTrigger) -> DeletionPlan {
        let target = match &trigger {
            DeletionTrigger::Namespace(name) => forest.get(name).map(|_| name.clone()),
            // Only an anchor that governs the namespace may delete it
            DeletionTrigger::Anchor(anchor) => forest
                .get(&anchor.name)
                .filter(|node| {
                    node.is_anchored_subnamespace
                        && node.parent.as_deref() == Some(anchor.namespace.as_str())
                })
                .map(|node| node.name.clone()),
        };

        let Some(target) = target else {
            return DeletionPlan {
                trigger,
                closure: Vec::new(),
                orphans: Vec::new(),
                broken_ancestry: Vec::new(),
            };
        };

        let mut closure = vec![target.clone()];
        let mut orphans = Vec::new();

        if forest.cascading_delete_allowed(&target) {
            let mut queue = VecDeque::from([target.clone()]);
            while let Some(ns) = queue.pop_front() {
                for child in forest.children(&ns) {
                    let anchored = forest
                        .get(&child)
                        .is_some_and(|node| node.is_anchored_subnamespace);
                    if anchored {
                        if !closure.contains(&child) {
                            closure.push(child.clone());
                            queue.push_back(child);
                        }
                    } else {
                        orphans.push(child);
                    }
                }
            }
        } else {
            orphans = forest.children(&target);
        }

        // Deepest first; the target has the smallest depth and goes last
        closure.sort_by_key(|ns| (Reverse(forest.ancestors(ns).len()), ns.clone()));

        let broken_ancestry = orphans
            .iter()
            .flat_map(|orphan| forest.descendants(orphan))
            .collect();

        DeletionPlan {
            trigger,
            closure,
            orphans,
            broken_ancestry,
        }
    }

    /// Delete the closure, then finalize the triggering anchor.
    ///
    /// Deletion is confirmed per namespace; execution stops at the first
    /// failure and reports the rest as remaining.
    pub async fn execute(&self, store: &dyn ObjectStore, plan: &DeletionPlan) -> CascadeOutcome {
        let mut outcome = CascadeOutcome::default();

        for (index, ns) in plan.closure.iter().enumerate() {
            match store.delete_namespace(ns).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {
                    debug!(namespace = %ns, "Namespace deleted");
                    outcome.deleted.push(ns.clone());
                }
                Err(e) => {
                    warn!(namespace = %ns, error = %e, "Cascading delete interrupted");
                    outcome.remaining = plan.closure[index..].to_vec();
                    outcome.errors.push(e);
                    return outcome;
                }
            }
        }

        if let DeletionTrigger::Anchor(anchor) = &plan.trigger {
            match store.delete_anchor(&anchor.namespace, &anchor.name).await {
                Ok(()) | Err(StoreError::NotFound(_)) => outcome.anchor_finalized = true,
                Err(e) => outcome.errors.push(e),
            }
        }

        if !plan.closure.is_empty() {
            info!(
                target = %plan.trigger.target(),
                deleted = outcome.deleted.len(),
                orphaned = plan.orphans.len(),
                "Cascading delete completed"
            );
        }

        outcome
    }
}
