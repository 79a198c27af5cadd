//! In-memory object store.
//!
//! Used by tests and by the controller binary. Beyond plain CRUD it models
//! the two failure classes the engine has to cope with: privileges the
//! controller lacks (writes of copies granting them are refused) and
//! transient unavailability (injected per namespace deletion).

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::traits::ObjectStore;
use crate::types::{
    Anchor, AnchorState, HierarchyRecord, Namespace, Object, ObjectKey, StoreError, StoreEvent,
    StoreResult,
};

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, Namespace>,
    records: BTreeMap<String, HierarchyRecord>,
    anchors: BTreeMap<(String, String), Anchor>,
    objects: BTreeMap<(String, ObjectKey), Object>,
    denied_privileges: HashSet<String>,
    delete_failures: HashMap<String, u32>,
}

impl State {
    fn require_namespace(&self, name: &str) -> StoreResult<()> {
        if self.namespaces.contains_key(name) {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("namespace {name}")))
        }
    }

    fn check_privilege(&self, object: &Object) -> StoreResult<()> {
        if !object.is_copy() {
            return Ok(());
        }
        match &object.privilege {
            Some(privilege) if self.denied_privileges.contains(privilege) => {
                Err(StoreError::PermissionDenied(format!(
                    "cannot grant {privilege} via {} in {}",
                    object.key(),
                    object.namespace
                )))
            }
            _ => Ok(()),
        }
    }
}

/// In-memory store for testing and local runs.
pub struct MemoryStore {
    state: RwLock<State>,
    events: broadcast::Sender<StoreEvent>,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            events,
            writes: AtomicU64::new(0),
        }
    }

    /// Refuse writes of copies that grant `privilege`.
    pub async fn deny_privilege(&self, privilege: impl Into<String>) {
        self.state.write().await.denied_privileges.insert(privilege.into());
    }

    /// Allow writes of copies that grant `privilege` again.
    pub async fn allow_privilege(&self, privilege: &str) {
        self.state.write().await.denied_privileges.remove(privilege);
    }

    /// Make the next `times` finalizations of `name` fail as unavailable.
    pub async fn fail_next_deletes(&self, name: impl Into<String>, times: u32) {
        self.state.write().await.delete_failures.insert(name.into(), times);
    }

    /// Number of mutating calls the store accepted, including no-op ones.
    ///
    /// Calls refused for a missing target, a conflict or a denied privilege
    /// are not counted.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Names of all namespaces currently stored.
    pub async fn namespace_names(&self) -> Vec<String> {
        self.state.read().await.namespaces.keys().cloned().collect()
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn emit(&self, event: StoreEvent) {
        debug!(event = ?event, "Store event");
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_namespaces(&self) -> StoreResult<Vec<Namespace>> {
        Ok(self.state.read().await.namespaces.values().cloned().collect())
    }

    async fn get_namespace(&self, name: &str) -> StoreResult<Namespace> {
        self.state
            .read()
            .await
            .namespaces
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("namespace {name}")))
    }

    async fn create_namespace(
        &self,
        name: &str,
        record: HierarchyRecord,
    ) -> StoreResult<Namespace> {
        let namespace = {
            let mut state = self.state.write().await;
            if state.namespaces.contains_key(name) {
                return Err(StoreError::Conflict(format!("namespace {name} already exists")));
            }
            self.record_write();
            let namespace = Namespace::new(name);
            state.namespaces.insert(name.to_string(), namespace.clone());
            if record != HierarchyRecord::default() {
                state.records.insert(name.to_string(), record);
            }
            namespace
        };
        self.emit(StoreEvent::Namespace { name: name.to_string() });
        Ok(namespace)
    }

    async fn mark_namespace_deleting(&self, name: &str) -> StoreResult<()> {
        {
            let mut state = self.state.write().await;
            let namespace = state
                .namespaces
                .get_mut(name)
                .ok_or_else(|| StoreError::NotFound(format!("namespace {name}")))?;
            self.record_write();
            if namespace.terminating {
                return Ok(());
            }
            namespace.terminating = true;
        }
        self.emit(StoreEvent::Namespace { name: name.to_string() });
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> StoreResult<()> {
        {
            let mut state = self.state.write().await;
            if let Some(remaining) = state.delete_failures.get_mut(name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Unavailable(format!(
                        "injected failure deleting {name}"
                    )));
                }
            }
            if state.namespaces.remove(name).is_none() {
                return Err(StoreError::NotFound(format!("namespace {name}")));
            }
            self.record_write();
            state.records.remove(name);
            state.anchors.retain(|(ns, _), _| ns != name);
            state.objects.retain(|(ns, _), _| ns != name);
        }
        self.emit(StoreEvent::Namespace { name: name.to_string() });
        Ok(())
    }

    async fn get_hierarchy(&self, namespace: &str) -> StoreResult<HierarchyRecord> {
        let state = self.state.read().await;
        state.require_namespace(namespace)?;
        Ok(state.records.get(namespace).cloned().unwrap_or_default())
    }

    async fn put_hierarchy(&self, namespace: &str, record: HierarchyRecord) -> StoreResult<()> {
        {
            let mut state = self.state.write().await;
            state.require_namespace(namespace)?;
            self.record_write();
            if state.records.get(namespace) == Some(&record) {
                return Ok(());
            }
            state.records.insert(namespace.to_string(), record);
        }
        self.emit(StoreEvent::Hierarchy {
            namespace: namespace.to_string(),
        });
        Ok(())
    }

    async fn list_anchors(&self, namespace: &str) -> StoreResult<Vec<Anchor>> {
        let state = self.state.read().await;
        state.require_namespace(namespace)?;
        Ok(state
            .anchors
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, anchor)| anchor.clone())
            .collect())
    }

    async fn create_anchor(&self, namespace: &str, name: &str) -> StoreResult<Anchor> {
        let anchor = {
            let mut state = self.state.write().await;
            state.require_namespace(namespace)?;
            let key = (namespace.to_string(), name.to_string());
            if state.anchors.contains_key(&key) {
                return Err(StoreError::Conflict(format!(
                    "anchor {name} already exists in {namespace}"
                )));
            }
            self.record_write();
            let anchor = Anchor::new(namespace, name);
            state.anchors.insert(key, anchor.clone());
            anchor
        };
        self.emit(StoreEvent::Anchor {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Ok(anchor)
    }

    async fn mark_anchor_deleting(&self, namespace: &str, name: &str) -> StoreResult<()> {
        {
            let mut state = self.state.write().await;
            let anchor = state
                .anchors
                .get_mut(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| StoreError::NotFound(format!("anchor {name} in {namespace}")))?;
            self.record_write();
            if anchor.terminating {
                return Ok(());
            }
            anchor.terminating = true;
        }
        self.emit(StoreEvent::Anchor {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn delete_anchor(&self, namespace: &str, name: &str) -> StoreResult<()> {
        {
            let mut state = self.state.write().await;
            if state
                .anchors
                .remove(&(namespace.to_string(), name.to_string()))
                .is_none()
            {
                return Err(StoreError::NotFound(format!("anchor {name} in {namespace}")));
            }
            self.record_write();
        }
        self.emit(StoreEvent::Anchor {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn update_anchor_state(
        &self,
        namespace: &str,
        name: &str,
        anchor_state: AnchorState,
    ) -> StoreResult<()> {
        {
            let mut state = self.state.write().await;
            let anchor = state
                .anchors
                .get_mut(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| StoreError::NotFound(format!("anchor {name} in {namespace}")))?;
            self.record_write();
            if anchor.state == anchor_state {
                return Ok(());
            }
            anchor.state = anchor_state;
        }
        self.emit(StoreEvent::Anchor {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn list_objects(&self, namespace: &str) -> StoreResult<Vec<Object>> {
        let state = self.state.read().await;
        state.require_namespace(namespace)?;
        Ok(state
            .objects
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn get_object(&self, namespace: &str, key: &ObjectKey) -> StoreResult<Object> {
        self.state
            .read()
            .await
            .objects
            .get(&(namespace.to_string(), key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{key} in {namespace}")))
    }

    async fn create_object(&self, object: Object) -> StoreResult<()> {
        let (namespace, key) = (object.namespace.clone(), object.key());
        {
            let mut state = self.state.write().await;
            state.require_namespace(&namespace)?;
            state.check_privilege(&object)?;
            let slot = (namespace.clone(), key.clone());
            if state.objects.contains_key(&slot) {
                return Err(StoreError::Conflict(format!("{key} already exists in {namespace}")));
            }
            self.record_write();
            state.objects.insert(slot, object);
        }
        self.emit(StoreEvent::Object { namespace, key });
        Ok(())
    }

    async fn update_object(&self, object: Object) -> StoreResult<()> {
        let (namespace, key) = (object.namespace.clone(), object.key());
        {
            let mut state = self.state.write().await;
            state.check_privilege(&object)?;
            let slot = (namespace.clone(), key.clone());
            let existing = state
                .objects
                .get_mut(&slot)
                .ok_or_else(|| StoreError::NotFound(format!("{key} in {namespace}")))?;
            self.record_write();
            if *existing == object {
                return Ok(());
            }
            *existing = object;
        }
        self.emit(StoreEvent::Object { namespace, key });
        Ok(())
    }

    async fn delete_object(&self, namespace: &str, key: &ObjectKey) -> StoreResult<()> {
        {
            let mut state = self.state.write().await;
            if state
                .objects
                .remove(&(namespace.to_string(), key.clone()))
                .is_none()
            {
                return Err(StoreError::NotFound(format!("{key} in {namespace}")));
            }
            self.record_write();
        }
        self.emit(StoreEvent::Object {
            namespace: namespace.to_string(),
            key: key.clone(),
        });
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
