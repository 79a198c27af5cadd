//! Hierarchy commands.
//!
//! The operations a user (or a CLI) performs on the hierarchy. Commands
//! only record intent in the store; the controller reacts to the resulting
//! events. Structural violations are rejected here, synchronously, and are
//! never retried.

use std::sync::Arc;
use tracing::info;

use crate::hierarchy::HierarchyStore;
use crate::store::ObjectStore;
use crate::types::{HierarchyRecord, HncError, Result, StoreError};

const MAX_NAME_LEN: usize = 63;

/// Check that `name` is a valid namespace name (a DNS label).
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(HncError::Invalid(format!(
            "\"{name}\" is not a valid namespace name"
        )))
    }
}

/// Command surface over an object store.
pub struct HierarchyCommands {
    store: Arc<dyn ObjectStore>,
}

impl HierarchyCommands {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Create a full namespace.
    pub async fn create_namespace(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.store
            .create_namespace(name, HierarchyRecord::default())
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => {
                    HncError::Invalid(format!("namespace \"{name}\" already exists"))
                }
                other => other.into(),
            })?;
        info!(namespace = %name, "Namespace created");
        Ok(())
    }

    /// Request deletion of a namespace.
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.store
            .mark_namespace_deleting(name)
            .await
            .map_err(|e| not_found(e, || format!("namespace \"{name}\"")))?;
        info!(namespace = %name, "Namespace deletion requested");
        Ok(())
    }

    /// Make `name` a root, creating it if it does not exist.
    pub async fn declare_root(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        match self.store.get_namespace(name).await {
            Ok(_) => self.unset_parent(name).await,
            Err(StoreError::NotFound(_)) => self.create_namespace(name).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the parent of an existing namespace, making it a root.
    pub async fn unset_parent(&self, name: &str) -> Result<()> {
        let mut record = self.record(name).await?;
        if record.is_anchored_subnamespace {
            return Err(HncError::Invalid(format!(
                "\"{name}\" is a subnamespace; delete its anchor instead"
            )));
        }
        if record.parent.take().is_none() {
            return Ok(());
        }
        self.store.put_hierarchy(name, record).await?;
        info!(namespace = %name, "Namespace is now a root");
        Ok(())
    }

    /// Set the parent of an existing namespace.
    pub async fn set_parent(&self, name: &str, parent: &str) -> Result<()> {
        let mut record = self.record(name).await?;
        if record.is_anchored_subnamespace && record.parent.as_deref() != Some(parent) {
            return Err(HncError::Invalid(format!(
                "\"{name}\" is a subnamespace of \"{}\"; its parent cannot be changed",
                record.parent.as_deref().unwrap_or_default()
            )));
        }
        self.check_edge(name, parent).await?;

        if record.parent.as_deref() == Some(parent) {
            return Ok(());
        }
        record.parent = Some(parent.to_string());
        self.store.put_hierarchy(name, record).await?;
        info!(namespace = %name, parent = %parent, "Parent set");
        Ok(())
    }

    /// Opt a namespace in or out of cascading deletion.
    pub async fn set_cascading_delete(&self, name: &str, allow: bool) -> Result<()> {
        let mut record = self.record(name).await?;
        if record.allow_cascading_delete == allow {
            return Ok(());
        }
        record.allow_cascading_delete = allow;
        self.store.put_hierarchy(name, record).await?;
        info!(namespace = %name, allow, "Cascading delete updated");
        Ok(())
    }

    /// Declare a subnamespace `name` of `parent` by creating its anchor.
    pub async fn create_anchored_subnamespace(&self, parent: &str, name: &str) -> Result<()> {
        validate_name(name)?;
        let namespace = self
            .store
            .get_namespace(parent)
            .await
            .map_err(|e| not_found(e, || format!("namespace \"{parent}\"")))?;
        if namespace.terminating {
            return Err(HncError::Invalid(format!(
                "namespace \"{parent}\" is being deleted"
            )));
        }

        self.store
            .create_anchor(parent, name)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => HncError::Invalid(format!(
                    "anchor \"{name}\" already exists in \"{parent}\""
                )),
                other => not_found(other, || format!("namespace \"{parent}\"")),
            })?;
        info!(parent = %parent, subnamespace = %name, "Anchor created");
        Ok(())
    }

    /// Delete the anchor of subnamespace `name` in `parent`.
    pub async fn delete_anchored_subnamespace(&self, parent: &str, name: &str) -> Result<()> {
        self.store
            .mark_anchor_deleting(parent, name)
            .await
            .map_err(|e| not_found(e, || format!("anchor \"{name}\" in \"{parent}\"")))?;
        info!(parent = %parent, subnamespace = %name, "Anchor deletion requested");
        Ok(())
    }

    /// Mark an existing namespace as a subnamespace of `parent`.
    ///
    /// Sets the parent as well. The parent does not need to hold an anchor;
    /// until it does, the namespace reports a missing anchor.
    pub async fn annotate_as_subnamespace_of(&self, name: &str, parent: &str) -> Result<()> {
        let mut record = self.record(name).await?;
        self.check_edge(name, parent).await?;

        if record.is_anchored_subnamespace && record.parent.as_deref() == Some(parent) {
            return Ok(());
        }
        record.parent = Some(parent.to_string());
        record.is_anchored_subnamespace = true;
        self.store.put_hierarchy(name, record).await?;
        info!(namespace = %name, parent = %parent, "Annotated as subnamespace");
        Ok(())
    }

    async fn record(&self, name: &str) -> Result<HierarchyRecord> {
        self.store
            .get_hierarchy(name)
            .await
            .map_err(|e| not_found(e, || format!("namespace \"{name}\"")))
    }

    /// Reject an edge to a missing parent or one that would close a cycle.
    async fn check_edge(&self, name: &str, parent: &str) -> Result<()> {
        validate_name(parent)?;
        let mut forest = HierarchyStore::load(self.store.as_ref()).await?;
        if !forest.contains(parent) {
            return Err(HncError::NotFound(format!("namespace \"{parent}\"")));
        }
        forest.upsert_namespace(name, Some(parent))
    }
}

fn not_found(error: StoreError, what: impl FnOnce() -> String) -> HncError {
    match error {
        StoreError::NotFound(_) => HncError::NotFound(what()),
        other => other.into(),
    }
}
