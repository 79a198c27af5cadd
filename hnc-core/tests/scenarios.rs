//! End-to-end hierarchy scenarios
//!
//! Drives the controller over an in-memory store through:
//! - Propagation failures and their attribution
//! - Subnamespace anchor lifecycle
//! - Bounded and mixed-branch cascading deletion
//! - Convergence and acyclicity properties

use std::sync::Arc;

use hnc_core::views;
use hnc_core::{
    AnchorState, ConditionKind, Controller, HierarchyCommands, HierarchyStore, HncConfig,
    MemoryStore, Object, ObjectKey, ObjectStore,
};

struct Harness {
    store: Arc<MemoryStore>,
    commands: HierarchyCommands,
    controller: Arc<Controller>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn ObjectStore> = store.clone();
        Self {
            commands: HierarchyCommands::new(Arc::clone(&shared)),
            controller: Controller::new(shared, HncConfig::default()),
            store,
        }
    }

    async fn settle(&self) {
        self.controller.run_until_idle().await.unwrap();
    }

    async fn conditions(&self, ns: &str) -> Vec<ConditionKind> {
        let record = self.store.get_hierarchy(ns).await.unwrap();
        record.conditions.iter().map(|c| c.kind).collect()
    }

    async fn exists(&self, ns: &str) -> bool {
        self.store.get_namespace(ns).await.is_ok()
    }

    /// Create `name` as an anchored subnamespace of `parent` and settle.
    async fn subnamespace(&self, parent: &str, name: &str) {
        self.commands.create_anchored_subnamespace(parent, name).await.unwrap();
        self.settle().await;
        assert!(self.exists(name).await, "{name} was not created");
    }

    async fn child(&self, parent: &str, name: &str) {
        self.commands.create_namespace(name).await.unwrap();
        self.commands.set_parent(name, parent).await.unwrap();
    }
}

// =============================================================================
// Propagation
// =============================================================================

#[tokio::test]
async fn test_propagation_failure_attribution() {
    let h = Harness::new();
    h.store.deny_privilege("cluster-admin").await;
    h.commands.declare_root("parent").await.unwrap();
    h.child("parent", "child").await;

    let binding = Object::new(
        "parent",
        "RoleBinding",
        "admin-binding",
        serde_json::json!({"roleRef": "cluster-admin", "subjects": ["ops"]}),
    )
    .with_privilege("cluster-admin");
    h.store.create_object(binding).await.unwrap();
    h.settle().await;

    assert_eq!(h.conditions("parent").await, vec![ConditionKind::CannotPropagateObject]);
    assert_eq!(h.conditions("child").await, vec![ConditionKind::CannotUpdateObject]);

    let tree = views::tree(&*h.store, "parent").await.unwrap();
    assert!(tree.contains("1) CannotPropagateObject"), "{tree}");
    assert!(tree.contains("2) CannotUpdateObject"), "{tree}");

    // Removing the link clears both
    h.commands.declare_root("child").await.unwrap();
    h.settle().await;

    assert!(h.conditions("parent").await.is_empty());
    assert!(h.conditions("child").await.is_empty());
    let described = views::describe(&*h.store, "parent").await.unwrap();
    assert!(described.contains("No conditions"), "{described}");
}

#[tokio::test]
async fn test_granting_permission_clears_conditions() {
    let h = Harness::new();
    h.store.deny_privilege("cluster-admin").await;
    h.commands.declare_root("parent").await.unwrap();
    h.child("parent", "child").await;
    let binding = Object::new("parent", "RoleBinding", "admins", serde_json::json!({}))
        .with_privilege("cluster-admin");
    h.store.create_object(binding.clone()).await.unwrap();
    h.settle().await;
    assert!(!h.conditions("child").await.is_empty());

    h.store.allow_privilege("cluster-admin").await;
    h.settle().await;

    assert!(h.conditions("parent").await.is_empty());
    assert!(h.conditions("child").await.is_empty());
    assert!(h.store.get_object("child", &binding.key()).await.is_ok());
}

#[tokio::test]
async fn test_propagation_composes_and_follows_reparenting() {
    let h = Harness::new();
    h.commands.declare_root("org").await.unwrap();
    h.commands.declare_root("other").await.unwrap();
    h.child("org", "team").await;
    h.child("team", "service").await;

    let reader = Object::new("org", "Role", "reader", serde_json::json!({"verbs": ["get"]}));
    let deployer = Object::new("team", "Role", "deployer", serde_json::json!({"verbs": ["create"]}));
    h.store.create_object(reader.clone()).await.unwrap();
    h.store.create_object(deployer.clone()).await.unwrap();
    h.settle().await;

    let copy = h.store.get_object("service", &reader.key()).await.unwrap();
    assert_eq!(copy.inherited_from.as_deref(), Some("org"));
    assert!(h.store.get_object("service", &deployer.key()).await.is_ok());
    assert!(h.store.get_object("org", &deployer.key()).await.is_err());

    // Severing org -> team removes org's copies below team only
    h.commands.set_parent("team", "other").await.unwrap();
    h.settle().await;

    assert!(h.store.get_object("team", &reader.key()).await.is_err());
    assert!(h.store.get_object("service", &reader.key()).await.is_err());
    assert!(h.store.get_object("service", &deployer.key()).await.is_ok());
}

// =============================================================================
// Anchors
// =============================================================================

#[tokio::test]
async fn test_anchor_lifecycle() {
    let h = Harness::new();
    h.commands.declare_root("parent").await.unwrap();
    h.commands.create_namespace("sub1").await.unwrap();
    h.commands.annotate_as_subnamespace_of("sub1", "parent").await.unwrap();
    h.settle().await;

    assert_eq!(h.conditions("sub1").await, vec![ConditionKind::SubnamespaceAnchorMissing]);
    // Never deleted for a missing declaration
    assert!(h.exists("sub1").await);

    h.commands.create_anchored_subnamespace("parent", "sub1").await.unwrap();
    h.settle().await;

    assert!(h.conditions("sub1").await.is_empty());
    let anchors = h.store.list_anchors("parent").await.unwrap();
    assert_eq!(anchors[0].state, AnchorState::Ok);
}

#[tokio::test]
async fn test_anchor_over_full_namespace_conflicts() {
    let h = Harness::new();
    h.commands.declare_root("parent").await.unwrap();
    h.commands.declare_root("taken").await.unwrap();
    h.commands.create_anchored_subnamespace("parent", "taken").await.unwrap();
    h.settle().await;

    let anchors = h.store.list_anchors("parent").await.unwrap();
    assert_eq!(anchors[0].state, AnchorState::Conflict);

    // Deleting the conflicting anchor leaves the namespace alone
    h.commands.delete_anchored_subnamespace("parent", "taken").await.unwrap();
    h.settle().await;

    assert!(h.exists("taken").await);
    assert!(h.store.list_anchors("parent").await.unwrap().is_empty());
}

// =============================================================================
// Cascading deletion
// =============================================================================

#[tokio::test]
async fn test_bounded_cascade() {
    let h = Harness::new();
    h.commands.declare_root("parent").await.unwrap();
    h.subnamespace("parent", "sub1").await;
    h.subnamespace("sub1", "sub1-sub1").await;
    h.subnamespace("sub1", "sub2-sub1").await;

    h.commands.set_cascading_delete("sub1", true).await.unwrap();
    h.commands.delete_anchored_subnamespace("parent", "sub1").await.unwrap();
    h.settle().await;

    for ns in ["sub1", "sub1-sub1", "sub2-sub1"] {
        assert!(!h.exists(ns).await, "{ns} survived");
        let err = h.commands.set_cascading_delete(ns, false).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
    assert!(h.exists("parent").await);
    assert!(h.store.list_anchors("parent").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_anchor_deletion_without_opt_in_orphans_children() {
    let h = Harness::new();
    h.commands.declare_root("parent").await.unwrap();
    h.subnamespace("parent", "sub1").await;
    h.subnamespace("sub1", "sub1-sub1").await;

    h.commands.delete_anchored_subnamespace("parent", "sub1").await.unwrap();
    h.settle().await;

    assert!(!h.exists("sub1").await);
    assert!(h.exists("sub1-sub1").await);
    assert_eq!(
        h.conditions("sub1-sub1").await,
        vec![
            ConditionKind::SubnamespaceAnchorMissing,
            ConditionKind::CritParentMissing
        ]
    );
}

#[tokio::test]
async fn test_mixed_branch_cascade_boundary() {
    let h = Harness::new();
    h.commands.declare_root("parent").await.unwrap();
    h.subnamespace("parent", "sub1").await;
    h.subnamespace("sub1", "sub1-sub1").await;
    h.subnamespace("sub1", "sub2-sub1").await;
    h.subnamespace("parent", "sub2").await;
    h.subnamespace("sub2", "subsub2").await;
    h.child("parent", "child").await;
    h.subnamespace("child", "subchild").await;

    h.commands.set_cascading_delete("parent", true).await.unwrap();
    h.commands.delete_namespace("parent").await.unwrap();
    h.settle().await;

    for ns in ["parent", "sub1", "sub1-sub1", "sub2-sub1", "sub2", "subsub2"] {
        assert!(!h.exists(ns).await, "{ns} survived");
    }
    assert!(h.exists("child").await);
    assert!(h.exists("subchild").await);
    assert_eq!(h.conditions("child").await, vec![ConditionKind::CritParentMissing]);
    assert_eq!(h.conditions("subchild").await, vec![ConditionKind::CritAncestor]);

    let tree = views::tree(&*h.store, "child").await.unwrap();
    assert!(tree.contains("CritParentMissing: missing parent"), "{tree}");
    let described = views::describe(&*h.store, "subchild").await.unwrap();
    assert!(described.contains("CritAncestor"), "{described}");
}

#[tokio::test]
async fn test_restoring_parent_clears_crit_conditions() {
    let h = Harness::new();
    h.commands.declare_root("parent").await.unwrap();
    h.child("parent", "child").await;
    h.subnamespace("child", "subchild").await;

    h.commands.delete_namespace("parent").await.unwrap();
    h.settle().await;
    assert_eq!(h.conditions("subchild").await, vec![ConditionKind::CritAncestor]);

    h.commands.declare_root("parent").await.unwrap();
    h.settle().await;

    assert!(h.conditions("child").await.is_empty());
    assert!(h.conditions("subchild").await.is_empty());
}

#[tokio::test]
async fn test_partial_deletion_failure_is_retried() {
    let h = Harness::new();
    h.commands.declare_root("parent").await.unwrap();
    h.subnamespace("parent", "sub1").await;
    h.subnamespace("sub1", "sub1-sub1").await;

    h.store.fail_next_deletes("sub1", 2).await;
    h.commands.set_cascading_delete("sub1", true).await.unwrap();
    h.commands.delete_anchored_subnamespace("parent", "sub1").await.unwrap();
    h.settle().await;

    assert!(!h.exists("sub1-sub1").await);
    assert!(!h.exists("sub1").await);
    assert!(h.store.list_anchors("parent").await.unwrap().is_empty());
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn test_idempotence() {
    let h = Harness::new();
    h.store.deny_privilege("cluster-admin").await;
    h.commands.declare_root("parent").await.unwrap();
    h.child("parent", "child").await;
    h.subnamespace("parent", "sub1").await;
    h.commands.create_namespace("stray").await.unwrap();
    h.commands.annotate_as_subnamespace_of("stray", "parent").await.unwrap();
    h.store
        .create_object(Object::new("parent", "Role", "reader", serde_json::json!({})))
        .await
        .unwrap();
    h.store
        .create_object(
            Object::new("parent", "RoleBinding", "admins", serde_json::json!({}))
                .with_privilege("cluster-admin"),
        )
        .await
        .unwrap();
    h.settle().await;

    let snapshot = |store: Arc<MemoryStore>| async move {
        let mut state = Vec::new();
        for ns in store.namespace_names().await {
            let record = store.get_hierarchy(&ns).await.unwrap();
            let objects = store.list_objects(&ns).await.unwrap();
            state.push((ns, record, objects));
        }
        state
    };

    let before = snapshot(h.store.clone()).await;
    let writes = h.store.write_count();
    let mut events = h.store.watch();
    h.settle().await;

    // Blocked copies are retried every pass but never accepted
    assert_eq!(h.store.write_count(), writes);
    assert!(events.try_recv().is_err());
    assert_eq!(snapshot(h.store.clone()).await, before);
    assert!(h
        .store
        .get_object("sub1", &ObjectKey::new("Role", "reader"))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_acyclicity() {
    let h = Harness::new();
    h.commands.declare_root("a").await.unwrap();
    h.child("a", "b").await;
    h.child("b", "c").await;

    for (name, parent) in [("a", "c"), ("a", "b"), ("b", "c"), ("c", "c")] {
        let err = h.commands.set_parent(name, parent).await.unwrap_err();
        assert_eq!(err.exit_code(), 1, "{name} -> {parent}");
    }
    h.settle().await;

    let forest = HierarchyStore::load(&*h.store).await.unwrap();
    for ns in ["a", "b", "c"] {
        let ancestors = forest.ancestors(ns);
        assert_eq!(ancestors.last().map(String::as_str), Some(ns));
        assert_eq!(ancestors.iter().filter(|a| a.as_str() == ns).count(), 1);
    }
    assert_eq!(forest.ancestors("c"), vec!["a", "b", "c"]);
}
