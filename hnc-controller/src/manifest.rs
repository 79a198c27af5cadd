//! Forest manifest
//!
//! A YAML description of the namespaces, anchors and native objects held by
//! the store, plus the privileges the controller is not allowed to grant.
//! The controller loads it into a `MemoryStore` on startup and writes the
//! converged state back after a mutating command.

use serde::{Deserialize, Serialize};
use std::path::Path;

use hnc_core::{HierarchyRecord, MemoryStore, Object, ObjectStore};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub denied_privileges: Vec<String>,
    #[serde(default)]
    pub namespaces: Vec<NamespaceSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub subnamespace: bool,
    #[serde(default)]
    pub allow_cascading_delete: bool,
    /// Deletion requested but not yet finalized
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminating: bool,
    /// Subnamespaces this namespace declares
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anchors: Vec<String>,
    /// Anchors whose deletion is still in progress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleting_anchors: Vec<String>,
    /// Native objects; propagated copies are not listed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<ObjectSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privilege: Option<String>,
}

impl Manifest {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Load from a file; a missing file is an empty forest.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&content)?)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// Populate an empty store.
    pub async fn apply(&self, store: &MemoryStore) -> hnc_core::Result<()> {
        for privilege in &self.denied_privileges {
            store.deny_privilege(privilege.as_str()).await;
        }

        for ns in &self.namespaces {
            let record = HierarchyRecord {
                parent: ns.parent.clone(),
                is_anchored_subnamespace: ns.subnamespace,
                allow_cascading_delete: ns.allow_cascading_delete,
                conditions: Vec::new(),
            };
            store.create_namespace(&ns.name, record).await?;
            if ns.terminating {
                store.mark_namespace_deleting(&ns.name).await?;
            }
        }

        for ns in &self.namespaces {
            for anchor in &ns.anchors {
                store.create_anchor(&ns.name, anchor).await?;
            }
            for anchor in &ns.deleting_anchors {
                store.create_anchor(&ns.name, anchor).await?;
                store.mark_anchor_deleting(&ns.name, anchor).await?;
            }
            for object in &ns.objects {
                let mut native =
                    Object::new(&ns.name, &object.kind, &object.name, object.spec.clone());
                native.privilege = object.privilege.clone();
                store.create_object(native).await?;
            }
        }

        Ok(())
    }

    /// Capture the current contents of a store.
    pub async fn capture(store: &MemoryStore, denied_privileges: Vec<String>) -> hnc_core::Result<Self> {
        let mut namespaces = Vec::new();

        for namespace in store.list_namespaces().await? {
            let record = store.get_hierarchy(&namespace.name).await?;
            let (deleting, live): (Vec<_>, Vec<_>) = store
                .list_anchors(&namespace.name)
                .await?
                .into_iter()
                .partition(|anchor| anchor.terminating);
            let objects = store
                .list_objects(&namespace.name)
                .await?
                .into_iter()
                .filter(|object| !object.is_copy())
                .map(|object| ObjectSpec {
                    kind: object.kind,
                    name: object.name,
                    spec: object.spec,
                    privilege: object.privilege,
                })
                .collect();

            namespaces.push(NamespaceSpec {
                name: namespace.name,
                parent: record.parent,
                subnamespace: record.is_anchored_subnamespace,
                allow_cascading_delete: record.allow_cascading_delete,
                terminating: namespace.terminating,
                anchors: live.into_iter().map(|anchor| anchor.name).collect(),
                deleting_anchors: deleting.into_iter().map(|anchor| anchor.name).collect(),
                objects,
            });
        }

        Ok(Self {
            denied_privileges,
            namespaces,
        })
    }
}
