//! Condition bookkeeping.
//!
//! Conditions are never patched incrementally. Every pass derives the full
//! set for each namespace of the subtree from the outputs of the other
//! components, compares it with what the status record holds, and writes
//! the record only when the two differ.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::anchor::AnchorReport;
use crate::hierarchy::HierarchyStore;
use crate::propagation::PropagationReport;
use crate::store::ObjectStore;
use crate::types::{Condition, ConditionKind, ObjectKey, Result, StoreError};

/// Desired condition sets, keyed by namespace.
pub type ConditionMap = BTreeMap<String, BTreeSet<Condition>>;

/// Conditions written for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionDelta {
    pub namespace: String,
    pub added: Vec<Condition>,
    pub removed: Vec<Condition>,
}

/// Condition manager.
#[derive(Debug, Default)]
pub struct ConditionManager;

impl ConditionManager {
    pub fn new() -> Self {
        Self
    }

    /// Derive the condition set of every namespace in `subtree`.
    pub fn compute(
        &self,
        forest: &HierarchyStore,
        subtree: &[String],
        propagation: &PropagationReport,
        anchors: &AnchorReport,
    ) -> ConditionMap {
        let mut desired: ConditionMap = subtree
            .iter()
            .filter(|ns| forest.contains(ns))
            .map(|ns| (ns.clone(), BTreeSet::new()))
            .collect();

        for (ns, conditions) in desired.iter_mut() {
            if let Some(parent) = forest.missing_parent(ns) {
                conditions.insert(
                    Condition::new(
                        ConditionKind::CritParentMissing,
                        format!("missing parent \"{parent}\""),
                    )
                    .with_subject(parent),
                );
            }

            let ancestors = forest.ancestors(ns);
            let broken = ancestors
                .iter()
                .take(ancestors.len().saturating_sub(1))
                .find(|ancestor| forest.is_orphan(ancestor));
            if let Some(ancestor) = broken {
                conditions.insert(
                    Condition::new(
                        ConditionKind::CritAncestor,
                        format!("ancestor \"{ancestor}\" has a missing parent"),
                    )
                    .with_subject(ancestor.as_str()),
                );
            }

            if anchors.missing_anchor.contains(ns) {
                let message = match forest.get(ns).and_then(|node| node.parent.as_deref()) {
                    Some(parent) => format!("no anchor for \"{ns}\" in parent \"{parent}\""),
                    None => "no parent declared for subnamespace".to_string(),
                };
                conditions.insert(Condition::new(ConditionKind::SubnamespaceAnchorMissing, message));
            }
        }

        // Blocked copies, grouped per source object
        let mut unreachable: BTreeMap<(String, ObjectKey), BTreeSet<String>> = BTreeMap::new();
        for copy in propagation.blocked() {
            unreachable
                .entry((copy.source_namespace.clone(), copy.key.clone()))
                .or_default()
                .insert(copy.target_namespace.clone());

            if let Some(conditions) = desired.get_mut(&copy.target_namespace) {
                let reason = copy.reason.as_deref().unwrap_or("refused by store");
                conditions.insert(
                    Condition::new(
                        ConditionKind::CannotUpdateObject,
                        format!(
                            "could not write {} from \"{}\": {reason}",
                            copy.key, copy.source_namespace
                        ),
                    )
                    .with_subject(copy.key.to_string()),
                );
            }
        }

        for ((source, key), targets) in unreachable {
            if let Some(conditions) = desired.get_mut(&source) {
                let targets: Vec<&str> = targets.iter().map(String::as_str).collect();
                conditions.insert(
                    Condition::new(
                        ConditionKind::CannotPropagateObject,
                        format!("could not propagate {key} to {}", targets.join(", ")),
                    )
                    .with_subject(key.to_string()),
                );
            }
        }

        for removal in &propagation.blocked_removals {
            if let Some(conditions) = desired.get_mut(&removal.target_namespace) {
                conditions.insert(
                    Condition::new(
                        ConditionKind::CannotUpdateObject,
                        format!("could not remove obsolete {}: {}", removal.key, removal.reason),
                    )
                    .with_subject(removal.key.to_string()),
                );
            }
        }

        desired
    }

    /// Write the conditions that changed.
    ///
    /// The status record is re-read before writing so that concurrent
    /// changes to the parent or flags are preserved.
    pub async fn apply(
        &self,
        store: &dyn ObjectStore,
        forest: &HierarchyStore,
        desired: ConditionMap,
    ) -> Result<Vec<ConditionDelta>> {
        let mut deltas = Vec::new();

        for (ns, wanted) in desired {
            let Some(node) = forest.get(&ns) else {
                continue;
            };
            let current: BTreeSet<Condition> = node.conditions.iter().cloned().collect();
            if current == wanted {
                continue;
            }

            let mut record = match store.get_hierarchy(&ns).await {
                Ok(record) => record,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            record.conditions = wanted.iter().cloned().collect();
            match store.put_hierarchy(&ns, record).await {
                Ok(()) => {}
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }

            let delta = ConditionDelta {
                added: wanted.difference(&current).cloned().collect(),
                removed: current.difference(&wanted).cloned().collect(),
                namespace: ns,
            };
            for condition in &delta.added {
                info!(namespace = %delta.namespace, kind = %condition.kind, message = %condition.message, "Condition set");
            }
            for condition in &delta.removed {
                debug!(namespace = %delta.namespace, kind = %condition.kind, "Condition cleared");
            }
            deltas.push(delta);
        }

        Ok(deltas)
    }
}
