//! In-memory model of the namespace forest.
//!
//! Nodes live in an arena indexed by name. A node stores only the *name* of
//! its parent; children are always derived by scanning for nodes that name
//! this one as parent, so there is a single source of truth for each edge.
//! A parent name that has no node is a missing parent (the node is an
//! orphan). The parent relation is kept acyclic: any edge that would make a
//! node its own ancestor is rejected before it is applied.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use tracing::warn;

use crate::store::ObjectStore;
use crate::types::{Anchor, Condition, HierarchyRecord, HncError, Result, StoreError};

/// One namespace in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceNode {
    /// Unique name
    pub name: String,
    /// Parent name (lookup only); absent for roots
    pub parent: Option<String>,
    /// Existence governed by an anchor in the parent
    pub is_anchored_subnamespace: bool,
    /// Cascading delete opt-in
    pub allow_cascading_delete: bool,
    /// Deletion requested but not finalized
    pub terminating: bool,
    /// Conditions as last written to the store
    pub conditions: Vec<Condition>,
}

impl NamespaceNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            is_anchored_subnamespace: false,
            allow_cascading_delete: false,
            terminating: false,
            conditions: Vec::new(),
        }
    }

    /// Status record carrying this node's state with the given conditions.
    pub fn to_record(&self, conditions: Vec<Condition>) -> HierarchyRecord {
        HierarchyRecord {
            parent: self.parent.clone(),
            is_anchored_subnamespace: self.is_anchored_subnamespace,
            allow_cascading_delete: self.allow_cascading_delete,
            conditions,
        }
    }
}

/// The namespace forest plus the anchors each namespace holds.
#[derive(Debug, Clone, Default)]
pub struct HierarchyStore {
    nodes: BTreeMap<String, NamespaceNode>,
    anchors: BTreeMap<String, BTreeMap<String, Anchor>>,
}

impl HierarchyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot of the forest from the object store.
    ///
    /// Records whose parent edge would close a cycle are loaded as roots.
    pub async fn load(store: &dyn ObjectStore) -> Result<Self> {
        let mut forest = Self::new();
        let mut parents = Vec::new();

        for namespace in store.list_namespaces().await? {
            let record = match store.get_hierarchy(&namespace.name).await {
                Ok(record) => record,
                // Finalized between list and get
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let anchors = match store.list_anchors(&namespace.name).await {
                Ok(anchors) => anchors,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            let mut node = NamespaceNode::new(&namespace.name);
            node.is_anchored_subnamespace = record.is_anchored_subnamespace;
            node.allow_cascading_delete = record.allow_cascading_delete;
            node.terminating = namespace.terminating;
            node.conditions = record.conditions;
            forest.nodes.insert(namespace.name.clone(), node);

            for anchor in anchors {
                forest.add_anchor(anchor);
            }
            if let Some(parent) = record.parent {
                parents.push((namespace.name, parent));
            }
        }

        for (name, parent) in parents {
            if let Err(e) = forest.upsert_namespace(&name, Some(&parent)) {
                warn!(namespace = %name, parent = %parent, error = %e, "Ignoring cyclic parent edge");
            }
        }

        Ok(forest)
    }

    /// Insert a namespace or change its parent.
    ///
    /// The parent does not need to exist (the node becomes an orphan), but
    /// the edge is rejected if the node would become its own ancestor.
    pub fn upsert_namespace(&mut self, name: &str, parent: Option<&str>) -> Result<()> {
        if let Some(parent) = parent {
            if self.would_cycle(name, parent) {
                return Err(HncError::Cycle {
                    namespace: name.to_string(),
                    parent: parent.to_string(),
                });
            }
        }

        let node = self
            .nodes
            .entry(name.to_string())
            .or_insert_with(|| NamespaceNode::new(name));
        node.parent = parent.map(str::to_string);
        Ok(())
    }

    /// Remove a namespace and the anchors it holds.
    ///
    /// Children keep naming it as their parent and become orphans.
    pub fn remove_namespace(&mut self, name: &str) {
        self.nodes.remove(name);
        self.anchors.remove(name);
    }

    pub fn set_cascading_delete(&mut self, name: &str, allow: bool) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.allow_cascading_delete = allow;
        }
    }

    pub fn set_anchored(&mut self, name: &str, anchored: bool) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.is_anchored_subnamespace = anchored;
        }
    }

    pub fn set_terminating(&mut self, name: &str, terminating: bool) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.terminating = terminating;
        }
    }

    pub fn set_conditions(&mut self, name: &str, conditions: Vec<Condition>) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.conditions = conditions;
        }
    }

    pub fn get(&self, name: &str) -> Option<&NamespaceNode> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// All namespace names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Parent of `name` if it exists in the forest.
    pub fn parent_of(&self, name: &str) -> Option<&str> {
        self.nodes
            .get(name)
            .and_then(|node| node.parent.as_deref())
            .filter(|parent| self.nodes.contains_key(*parent))
    }

    /// Parent name recorded by `name` that has no node.
    pub fn missing_parent(&self, name: &str) -> Option<&str> {
        self.nodes
            .get(name)
            .and_then(|node| node.parent.as_deref())
            .filter(|parent| !self.nodes.contains_key(*parent))
    }

    /// Whether the recorded parent of `name` does not exist.
    pub fn is_orphan(&self, name: &str) -> bool {
        self.missing_parent(name).is_some()
    }

    /// Existing ancestors of `name`, ordered root first and ending with `name`.
    ///
    /// Empty if `name` is unknown.
    pub fn ancestors(&self, name: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(name);

        while let Some(ns) = current {
            if !self.nodes.contains_key(ns) || !seen.insert(ns) {
                break;
            }
            chain.push(ns.to_string());
            current = self.parent_of(ns);
        }

        chain.reverse();
        chain
    }

    /// Topmost existing ancestor of `name`.
    pub fn root_of(&self, name: &str) -> Option<String> {
        self.ancestors(name).into_iter().next()
    }

    /// Namespaces without an existing parent.
    pub fn roots(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|name| self.parent_of(name).is_none())
            .cloned()
            .collect()
    }

    /// Direct children of `name`, derived from the parent edges.
    pub fn children(&self, name: &str) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| node.parent.as_deref() == Some(name))
            .map(|node| node.name.clone())
            .collect()
    }

    /// Transitive descendants of `name` (excluding `name`).
    pub fn descendants(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue: VecDeque<String> = self.children(name).into();

        while let Some(ns) = queue.pop_front() {
            if ns == name || !found.insert(ns.clone()) {
                continue;
            }
            queue.extend(self.children(&ns));
        }

        found
    }

    /// `root` and all its descendants, ordered by depth (breadth first).
    pub fn subtree_top_down(&self, root: &str) -> Vec<String> {
        if !self.nodes.contains_key(root) {
            return Vec::new();
        }

        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root.to_string()]);

        while let Some(ns) = queue.pop_front() {
            if !seen.insert(ns.clone()) {
                continue;
            }
            queue.extend(self.children(&ns));
            order.push(ns);
        }

        order
    }

    /// Whether some strict ancestor of `name` is an orphan.
    pub fn has_broken_ancestry(&self, name: &str) -> bool {
        let chain = self.ancestors(name);
        chain
            .iter()
            .take(chain.len().saturating_sub(1))
            .any(|ns| self.is_orphan(ns))
    }

    /// Cascading delete opt-in, inherited down the anchored chain.
    pub fn cascading_delete_allowed(&self, name: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = name;

        loop {
            let Some(node) = self.nodes.get(current) else {
                return false;
            };
            if node.allow_cascading_delete {
                return true;
            }
            if !node.is_anchored_subnamespace || !seen.insert(current) {
                return false;
            }
            match self.parent_of(current) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    pub fn add_anchor(&mut self, anchor: Anchor) {
        self.anchors
            .entry(anchor.namespace.clone())
            .or_default()
            .insert(anchor.name.clone(), anchor);
    }

    pub fn remove_anchor(&mut self, namespace: &str, name: &str) {
        if let Some(anchors) = self.anchors.get_mut(namespace) {
            anchors.remove(name);
        }
    }

    pub fn anchor(&self, namespace: &str, name: &str) -> Option<&Anchor> {
        self.anchors.get(namespace).and_then(|anchors| anchors.get(name))
    }

    /// Anchors held by `namespace`, sorted by name.
    pub fn anchors_in(&self, namespace: &str) -> impl Iterator<Item = &Anchor> {
        self.anchors
            .get(namespace)
            .into_iter()
            .flat_map(|anchors| anchors.values())
    }

    /// Walk up from `parent`; a cycle exists if we reach `name`.
    fn would_cycle(&self, name: &str, parent: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(parent);

        while let Some(ns) = current {
            if ns == name {
                return true;
            }
            if !seen.insert(ns) {
                // Pre-existing loop not involving `name`
                return false;
            }
            current = self.nodes.get(ns).and_then(|node| node.parent.as_deref());
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forest(edges: &[(&str, Option<&str>)]) -> HierarchyStore {
        let mut forest = HierarchyStore::new();
        for (name, parent) in edges {
            forest.upsert_namespace(name, *parent).unwrap();
        }
        forest
    }

    #[test]
    fn test_ancestors_root_first() {
        let forest = forest(&[("a", None), ("b", Some("a")), ("c", Some("b"))]);
        assert_eq!(forest.ancestors("c"), vec!["a", "b", "c"]);
        assert_eq!(forest.ancestors("a"), vec!["a"]);
        assert!(forest.ancestors("missing").is_empty());
        assert_eq!(forest.root_of("c").as_deref(), Some("a"));
    }

    #[test]
    fn test_rejects_cycles() {
        let mut forest = forest(&[("a", None), ("b", Some("a")), ("c", Some("b"))]);

        let err = forest.upsert_namespace("a", Some("c")).unwrap_err();
        assert!(matches!(err, HncError::Cycle { .. }));
        assert_eq!(err.exit_code(), 1);

        assert!(forest.upsert_namespace("a", Some("a")).is_err());

        // Rejected edge was not applied
        assert_eq!(forest.get("a").unwrap().parent, None);
        assert!(!forest.ancestors("a").contains(&"c".to_string()));
    }

    #[test]
    fn test_children_are_derived() {
        let mut forest = forest(&[("a", None), ("b", Some("a")), ("c", Some("a"))]);
        assert_eq!(forest.children("a"), vec!["b", "c"]);

        forest.upsert_namespace("c", None).unwrap();
        assert_eq!(forest.children("a"), vec!["b"]);
        assert_eq!(forest.roots(), vec!["a", "c"]);
    }

    #[test]
    fn test_descendants_and_top_down_order() {
        let forest = forest(&[
            ("root", None),
            ("z", Some("root")),
            ("a", Some("root")),
            ("z1", Some("z")),
            ("a1", Some("a")),
        ]);

        let descendants: Vec<_> = forest.descendants("root").into_iter().collect();
        assert_eq!(descendants, vec!["a", "a1", "z", "z1"]);

        let order = forest.subtree_top_down("root");
        assert_eq!(order[0], "root");
        let depth_of = |ns: &str| order.iter().position(|n| n == ns).unwrap();
        assert!(depth_of("a") < depth_of("a1"));
        assert!(depth_of("z") < depth_of("a1"));
        assert!(depth_of("a") < depth_of("z1"));
    }

    #[test]
    fn test_orphans_after_removal() {
        let mut forest = forest(&[("p", None), ("c", Some("p")), ("g", Some("c"))]);
        forest.remove_namespace("p");

        assert!(forest.is_orphan("c"));
        assert_eq!(forest.missing_parent("c"), Some("p"));
        assert!(!forest.is_orphan("g"));
        assert!(forest.has_broken_ancestry("g"));
        assert!(!forest.has_broken_ancestry("c"));
        assert_eq!(forest.ancestors("g"), vec!["c", "g"]);
        assert_eq!(forest.roots(), vec!["c"]);
    }

    #[test]
    fn test_cascading_delete_inherits_along_anchored_chain() {
        let mut forest = forest(&[
            ("p", None),
            ("s", Some("p")),
            ("ss", Some("s")),
            ("full", Some("p")),
            ("fs", Some("full")),
        ]);
        for anchored in ["s", "ss", "fs"] {
            forest.set_anchored(anchored, true);
        }
        forest.set_cascading_delete("p", true);

        assert!(forest.cascading_delete_allowed("p"));
        assert!(forest.cascading_delete_allowed("s"));
        assert!(forest.cascading_delete_allowed("ss"));
        // Chain is broken by a namespace that is not anchored
        assert!(!forest.cascading_delete_allowed("full"));
        assert!(!forest.cascading_delete_allowed("fs"));
    }

    #[test]
    fn test_anchor_index() {
        let mut forest = forest(&[("p", None)]);
        forest.add_anchor(Anchor::new("p", "b"));
        forest.add_anchor(Anchor::new("p", "a"));

        let names: Vec<_> = forest.anchors_in("p").map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(forest.anchor("p", "a").is_some());

        forest.remove_anchor("p", "a");
        assert!(forest.anchor("p", "a").is_none());
        assert_eq!(forest.anchors_in("q").count(), 0);
    }
}
