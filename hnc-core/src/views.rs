//! Human-readable views of the hierarchy.
//!
//! - `describe`: configuration and conditions of one namespace
//! - `tree`: a subtree with inline condition markers and a legend
//! - `status_yaml`: the per-namespace status document

use std::collections::BTreeMap;

use crate::hierarchy::HierarchyStore;
use crate::store::ObjectStore;
use crate::types::{Condition, HierarchyRecord, HncError, Namespace, Result, StoreError};

/// Describe a namespace.
pub async fn describe(store: &dyn ObjectStore, namespace: &str) -> Result<String> {
    let forest = HierarchyStore::load(store).await?;
    let metadata = match store.get_namespace(namespace).await {
        Ok(metadata) => Some(metadata),
        Err(StoreError::NotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };
    render_describe(&forest, namespace, metadata.as_ref())
        .ok_or_else(|| HncError::NotFound(format!("namespace \"{namespace}\"")))
}

/// Render the tree rooted at `namespace`.
pub async fn tree(store: &dyn ObjectStore, namespace: &str) -> Result<String> {
    let forest = HierarchyStore::load(store).await?;
    render_tree(&forest, namespace)
        .ok_or_else(|| HncError::NotFound(format!("namespace \"{namespace}\"")))
}

/// Serialize a status record.
pub fn status_yaml(record: &HierarchyRecord) -> Result<String> {
    serde_yaml::to_string(record).map_err(|e| HncError::Invalid(e.to_string()))
}

pub fn render_describe(
    forest: &HierarchyStore,
    namespace: &str,
    metadata: Option<&Namespace>,
) -> Option<String> {
    let node = forest.get(namespace)?;
    let mut out = String::new();

    out.push_str(&format!("Hierarchy configuration for namespace {namespace}\n"));
    if let Some(metadata) = metadata {
        out.push_str(&format!("  UID: {}\n", metadata.uid));
        out.push_str(&format!(
            "  Created: {}\n",
            metadata.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    match (&node.parent, forest.is_orphan(namespace)) {
        (Some(parent), true) => out.push_str(&format!("  Parent: {parent} (missing)\n")),
        (Some(parent), false) => out.push_str(&format!("  Parent: {parent}\n")),
        (None, _) => out.push_str("  No parent\n"),
    }

    let children = forest.children(namespace);
    if children.is_empty() {
        out.push_str("  No children\n");
    } else {
        out.push_str("  Children:\n");
        for child in children {
            out.push_str(&format!("  - {}\n", label(forest, &child)));
        }
    }

    if node.is_anchored_subnamespace {
        out.push_str("  Subnamespace: true\n");
    }
    out.push_str(&format!(
        "  Allow cascading delete: {}\n",
        node.allow_cascading_delete
    ));
    if node.terminating {
        out.push_str("  Terminating: true\n");
    }

    if node.conditions.is_empty() {
        out.push_str("\nNo conditions\n");
    } else {
        out.push_str("\nConditions:\n");
        for condition in &node.conditions {
            match &condition.subject {
                Some(subject) => out.push_str(&format!(
                    "  - {} ({subject}): {}\n",
                    condition.kind, condition.message
                )),
                None => out.push_str(&format!("  - {}: {}\n", condition.kind, condition.message)),
            }
        }
    }

    Some(out)
}

pub fn render_tree(forest: &HierarchyStore, namespace: &str) -> Option<String> {
    forest.get(namespace)?;

    let mut legend = Legend::default();
    let mut out = String::new();
    out.push_str(&line(forest, namespace, &mut legend));
    out.push('\n');
    render_children(forest, namespace, "", &mut legend, &mut out);

    if !legend.entries.is_empty() {
        out.push_str("\nConditions:\n");
        for (index, condition) in legend.entries.iter().enumerate() {
            out.push_str(&format!(
                "{}) {}: {}\n",
                index + 1,
                condition.kind,
                condition.message
            ));
        }
    }

    Some(out)
}

fn render_children(
    forest: &HierarchyStore,
    namespace: &str,
    prefix: &str,
    legend: &mut Legend,
    out: &mut String,
) {
    let children = forest.children(namespace);
    let count = children.len();

    for (index, child) in children.iter().enumerate() {
        let last = index + 1 == count;
        let branch = if last { "└── " } else { "├── " };
        out.push_str(&format!("{prefix}{branch}{}\n", line(forest, child, legend)));

        let nested = format!("{prefix}{}", if last { "    " } else { "│   " });
        render_children(forest, child, &nested, legend, out);
    }
}

fn label(forest: &HierarchyStore, namespace: &str) -> String {
    match forest.get(namespace) {
        Some(node) if node.is_anchored_subnamespace => format!("{namespace} (s)"),
        _ => namespace.to_string(),
    }
}

fn line(forest: &HierarchyStore, namespace: &str, legend: &mut Legend) -> String {
    let mut text = label(forest, namespace);
    let markers: Vec<String> = forest
        .get(namespace)
        .map(|node| node.conditions.iter().map(|c| legend.number(c).to_string()).collect())
        .unwrap_or_default();
    if !markers.is_empty() {
        text.push_str(&format!(" ({})", markers.join(", ")));
    }
    text
}

/// Numbered conditions, in order of first appearance.
#[derive(Default)]
struct Legend {
    entries: Vec<Condition>,
    index: BTreeMap<Condition, usize>,
}

impl Legend {
    fn number(&mut self, condition: &Condition) -> usize {
        if let Some(number) = self.index.get(condition) {
            return *number;
        }
        self.entries.push(condition.clone());
        let number = self.entries.len();
        self.index.insert(condition.clone(), number);
        number
    }
}
