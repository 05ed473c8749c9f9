//! Keyed registry of running tasks.
//!
//! At most one task runs per key. Removal aborts the task and waits until it
//! has actually stopped before reporting success.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use unison_core::{Error, Result};

/// Keys of the tasks the devices manager runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    /// Polling loop of one device
    Polling(String),
    /// Push dispatcher of one transport
    Dispatch(String),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Polling(device_id) => write!(f, "polling:{device_id}"),
            Self::Dispatch(transport_id) => write!(f, "dispatch:{transport_id}"),
        }
    }
}

pub struct TasksRegistry<K> {
    tasks: Mutex<HashMap<K, JoinHandle<()>>>,
}

impl<K> Default for TasksRegistry<K> {
    fn default() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> TasksRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the task built by `factory` under `key`.
    ///
    /// Fails without spawning anything when `key` is already registered.
    pub fn add<F, Fut>(&self, key: K, factory: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("task '{key}'")));
        }
        let handle = tokio::spawn(factory());
        tracing::debug!(task = %key, "Task started");
        tasks.insert(key, handle);
        Ok(())
    }

    /// Abort the task under `key` and wait for it to terminate.
    pub async fn remove(&self, key: &K) -> bool {
        let handle = self.tasks.lock().remove(key);
        match handle {
            Some(handle) => {
                handle.abort();
                // Cancellation surfaces as a JoinError.
                let _ = handle.await;
                tracing::debug!(task = %key, "Task stopped");
                true
            }
            None => false,
        }
    }

    /// Remove every task whose key matches `predicate`; returns how many.
    pub async fn remove_where(&self, predicate: impl Fn(&K) -> bool) -> usize {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock();
            let keys: Vec<K> = tasks.keys().filter(|k| predicate(k)).cloned().collect();
            keys.iter().filter_map(|k| tasks.remove(k)).collect()
        };
        let count = handles.len();
        drain(handles).await;
        count
    }

    /// Abort and await every task, leaving the registry empty.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain().map(|(_, h)| h).collect();
        let count = handles.len();
        drain(handles).await;
        tracing::debug!(count, "Task registry drained");
    }

    pub fn has(&self, key: &K) -> bool {
        self.tasks.lock().contains_key(key)
    }

    /// Whether the task under `key` is registered and still running.
    pub fn is_running(&self, key: &K) -> bool {
        self.tasks
            .lock()
            .get(key)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<K> {
        self.tasks.lock().keys().cloned().collect()
    }
}

async fn drain(handles: Vec<JoinHandle<()>>) {
    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Sets its flag when dropped, i.e. when the task future is torn down.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Never finishes. The flag is owned by the future from the start, so
    /// it is set even when the task is aborted before its first poll.
    fn pending_task(flag: Arc<AtomicBool>) -> impl Future<Output = ()> + Send + 'static {
        let guard = DropFlag(flag);
        async move {
            let _guard = guard;
            futures::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected_before_spawn() {
        let registry = TasksRegistry::new();
        registry
            .add(TaskKey::Polling("d1".into()), || async {})
            .unwrap();

        let mut built = false;
        let err = registry
            .add(TaskKey::Polling("d1".into()), || {
                built = true;
                async {}
            })
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert!(!built);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_waits_for_termination() {
        let registry = TasksRegistry::new();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        registry
            .add(TaskKey::Polling("d1".into()), move || pending_task(flag))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.is_running(&TaskKey::Polling("d1".into())));

        assert!(registry.remove(&TaskKey::Polling("d1".into())).await);
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!registry.has(&TaskKey::Polling("d1".into())));
        assert!(!registry.remove(&TaskKey::Polling("d1".into())).await);
    }

    #[tokio::test]
    async fn test_shutdown_drains_everything() {
        let registry = TasksRegistry::new();
        let flags: Vec<_> = (0..5).map(|_| Arc::new(AtomicBool::new(false))).collect();
        for (i, flag) in flags.iter().enumerate() {
            let flag = flag.clone();
            registry
                .add(TaskKey::Polling(format!("d{i}")), move || pending_task(flag))
                .unwrap();
        }
        registry
            .add(TaskKey::Dispatch("mqtt".into()), || async {})
            .unwrap();
        assert_eq!(registry.len(), 6);

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert!(flags.iter().all(|f| f.load(Ordering::SeqCst)));

        // Keys are free again after shutdown.
        registry
            .add(TaskKey::Polling("d0".into()), || async {})
            .unwrap();
    }

    #[tokio::test]
    async fn test_remove_where_filters_by_key() {
        let registry = TasksRegistry::new();
        for key in [
            TaskKey::Polling("a".into()),
            TaskKey::Polling("b".into()),
            TaskKey::Dispatch("mqtt".into()),
        ] {
            registry.add(key, || futures::future::pending::<()>()).unwrap();
        }
        let removed = registry
            .remove_where(|k| matches!(k, TaskKey::Polling(_)))
            .await;
        assert_eq!(removed, 2);
        assert_eq!(registry.keys(), vec![TaskKey::Dispatch("mqtt".into())]);
    }
}
