//! Event-driven controller.
//!
//! Store events are mapped to namespace keys and fed into a work queue.
//! Workers take keys, resolve the roots of the affected trees, and run a
//! reconcile pass per root while holding that root's lock, so disjoint
//! trees are processed in parallel and passes over the same tree never
//! overlap.
//!
//! ```text
//!  store ──watch──► WorkQueue ──► worker 1 ─┐
//!                       ▲        worker 2 ─┼─► lock(root) ─► Reconciler
//!                       │        worker N ─┘
//!                       └──── requeue / backoff
//! ```

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::HncConfig;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::store::ObjectStore;
use crate::types::{Result, StoreEvent};

/// Outcome of processing one key.
#[derive(Debug, Default)]
struct KeyOutcome {
    requeue: Vec<String>,
    retry: bool,
}

/// Hierarchy controller.
pub struct Controller {
    store: Arc<dyn ObjectStore>,
    config: HncConfig,
    queue: Arc<WorkQueue>,
    reconciler: Reconciler,
    locks: DashMap<String, Arc<Mutex<()>>>,
    events: Mutex<Option<broadcast::Receiver<StoreEvent>>>,
}

impl Controller {
    /// Create a controller. Subscribes to store events immediately, so
    /// changes made before `start` or `run_until_idle` are not missed.
    pub fn new(store: Arc<dyn ObjectStore>, config: HncConfig) -> Arc<Self> {
        let events = store.watch();
        Arc::new(Self {
            queue: Arc::new(WorkQueue::new(config.queue.clone())),
            reconciler: Reconciler::new(Arc::clone(&store), &config),
            locks: DashMap::new(),
            events: Mutex::new(Some(events)),
            store,
            config,
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Enqueue every namespace.
    pub async fn resync_all(&self) -> Result<usize> {
        let namespaces = self.store.list_namespaces().await?;
        for namespace in &namespaces {
            self.queue.add(&namespace.name).await;
        }
        debug!(count = namespaces.len(), "Resync queued all namespaces");
        Ok(namespaces.len())
    }

    /// Spawn the watch task and the workers.
    pub async fn start(self: &Arc<Self>) -> Result<ControllerHandle> {
        let events = self.events.lock().await.take();
        let mut events = events.unwrap_or_else(|| self.store.watch());

        let watcher = {
            let controller = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => controller.queue.add(event.affected_namespace()).await,
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Event stream lagged, resyncing");
                            if let Err(e) = controller.resync_all().await {
                                error!(error = %e, "Resync failed");
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };

        let workers = (0..self.config.workers)
            .map(|id| {
                let controller = Arc::clone(self);
                tokio::spawn(async move {
                    while let Some(key) = controller.queue.get().await {
                        controller.process(&key).await;
                    }
                    debug!(worker = id, "Worker stopped");
                })
            })
            .collect();

        self.resync_all().await?;
        info!(workers = self.config.workers, "Controller started");

        Ok(ControllerHandle {
            queue: Arc::clone(&self.queue),
            watcher: Some(watcher),
            workers,
        })
    }

    /// Drive the queue on the caller's task until nothing is left to do.
    ///
    /// Returns the number of keys processed.
    pub async fn run_until_idle(&self) -> Result<usize> {
        self.resync_all().await?;
        let mut processed = 0;
        let mut drains = 0;

        loop {
            self.drain_events().await?;

            if let Some(key) = self.queue.try_get().await {
                self.process(&key).await;
                processed += 1;
                continue;
            }

            if self.queue.is_idle().await {
                break;
            }
            // Only backoff timers left
            tokio::time::sleep(self.config.queue.backoff(0)).await;

            drains += 1;
            if drains >= self.config.max_passes {
                warn!(processed, "Queue did not settle");
                break;
            }
        }

        Ok(processed)
    }

    async fn drain_events(&self) -> Result<()> {
        let mut guard = self.events.lock().await;
        let Some(events) = guard.as_mut() else {
            return Ok(());
        };

        let mut keys = Vec::new();
        let mut lagged = false;
        loop {
            match events.try_recv() {
                Ok(event) => keys.push(event.affected_namespace().to_string()),
                Err(TryRecvError::Lagged(_)) => lagged = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        drop(guard);

        for key in keys {
            self.queue.add(&key).await;
        }
        if lagged {
            self.resync_all().await?;
        }
        Ok(())
    }

    /// Process one key taken from the queue.
    async fn process(&self, key: &str) {
        match self.reconcile_key(key).await {
            Ok(outcome) => {
                for other in &outcome.requeue {
                    self.queue.add(other).await;
                }
                if outcome.retry {
                    self.queue.add_rate_limited(key).await;
                } else {
                    self.queue.forget(key).await;
                }
            }
            Err(e) if e.is_transient() => {
                warn!(key = %key, error = %e, "Transient failure, will retry");
                self.queue.add_rate_limited(key).await;
            }
            Err(e) => {
                error!(key = %key, error = %e, "Reconcile failed");
                self.queue.forget(key).await;
            }
        }
        self.queue.done(key).await;
    }

    async fn reconcile_key(&self, key: &str) -> Result<KeyOutcome> {
        let mut outcome = KeyOutcome::default();

        for root in self.reconciler.resolve_roots(key).await? {
            let report = {
                let lock = self.root_lock(&root);
                let _guard = lock.lock().await;
                self.reconciler.reconcile_root(&root).await
            };
            self.release_lock(&root);

            let report = report?;
            if report.needs_retry() {
                for e in &report.transient {
                    debug!(root = %root, error = %e, "Pass left transient failures");
                }
                outcome.retry = true;
            }
            outcome.requeue.extend(report.requeue);
        }

        Ok(outcome)
    }

    fn root_lock(&self, root: &str) -> Arc<Mutex<()>> {
        self.locks.entry(root.to_string()).or_default().clone()
    }

    /// Evict a root's lock once no pass holds or awaits it.
    fn release_lock(&self, root: &str) {
        self.locks.remove_if(root, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Handle to a running controller.
///
/// Dropping the handle stops the controller.
pub struct ControllerHandle {
    queue: Arc<WorkQueue>,
    watcher: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl ControllerHandle {
    /// Stop accepting keys and wait for in-flight passes to finish.
    pub async fn shutdown(mut self) {
        self.queue.shutdown();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        let workers = std::mem::take(&mut self.workers);
        for result in join_all(workers).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!(error = %e, "Worker panicked");
                }
            }
        }
        info!("Controller stopped");
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        self.queue.shutdown();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{HierarchyRecord, Object, ObjectKey};
    use std::time::Duration;

    fn controller(store: &Arc<MemoryStore>) -> Arc<Controller> {
        let store: Arc<dyn ObjectStore> = store.clone();
        Controller::new(store, HncConfig::default())
    }

    #[tokio::test]
    async fn test_run_until_idle_converges() {
        let store = Arc::new(MemoryStore::new());
        store.create_namespace("a", HierarchyRecord::default()).await.unwrap();
        let record = HierarchyRecord {
            parent: Some("a".to_string()),
            ..Default::default()
        };
        store.create_namespace("b", record).await.unwrap();
        store
            .create_object(Object::new("a", "Role", "reader", serde_json::json!({})))
            .await
            .unwrap();

        let controller = controller(&store);
        controller.run_until_idle().await.unwrap();
        assert!(store.get_object("b", &ObjectKey::new("Role", "reader")).await.is_ok());

        let writes = store.write_count();
        controller.run_until_idle().await.unwrap();
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_root_locks_are_released() {
        let store = Arc::new(MemoryStore::new());
        for name in ["a", "b", "c"] {
            store.create_namespace(name, HierarchyRecord::default()).await.unwrap();
        }
        let controller = controller(&store);
        controller.run_until_idle().await.unwrap();

        store.delete_namespace("b").await.unwrap();
        controller.run_until_idle().await.unwrap();

        assert!(controller.locks.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        store.create_namespace("a", HierarchyRecord::default()).await.unwrap();
        store.create_namespace("doomed", HierarchyRecord::default()).await.unwrap();
        store.fail_next_deletes("doomed", 2).await;
        store.mark_namespace_deleting("doomed").await.unwrap();

        let controller = controller(&store);
        controller.run_until_idle().await.unwrap();

        assert!(store.get_namespace("doomed").await.is_err());
        assert_eq!(controller.queue().failures("doomed").await, 0);
    }

    #[tokio::test]
    async fn test_started_controller_reacts_to_events() {
        let store = Arc::new(MemoryStore::new());
        store.create_namespace("a", HierarchyRecord::default()).await.unwrap();
        let controller = controller(&store);
        let handle = controller.start().await.unwrap();

        store.create_anchor("a", "sub").await.unwrap();

        let mut created = false;
        for _ in 0..100 {
            if store.get_namespace("sub").await.is_ok() {
                created = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert!(created);
        assert!(controller.queue().is_shutting_down());
    }
}
