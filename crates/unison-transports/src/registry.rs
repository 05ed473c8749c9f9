//! Push dispatch registries.
//!
//! [`ListenerRegistry`] maps generated listener ids to async callbacks and
//! keeps a reverse index from [`AddressId`] to the listeners interested in it.
//! [`ReadHandlerRegistry`] holds one-shot waiters for request/response reads.
//! Both are plain structs owned by whoever needs them; there is no global
//! state.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use unison_core::Value;

use crate::address::AddressId;
use crate::client::PushMessage;

/// Generated listener identifier.
pub type ListenerId = String;

/// Async push callback.
pub type Listener = Arc<dyn Fn(PushMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into a [`Listener`].
pub fn listener<F, Fut>(f: F) -> Listener
where
    F: Fn(PushMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

#[derive(Default)]
struct Listeners {
    by_id: HashMap<ListenerId, (AddressId, Listener)>,
    by_address: HashMap<AddressId, HashSet<ListenerId>>,
}

/// Listener id → callback, plus address id → listener ids.
#[derive(Default)]
pub struct ListenerRegistry {
    inner: Mutex<Listeners>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for messages on `address_id`; returns a fresh id.
    pub fn register(&self, address_id: AddressId, callback: Listener) -> ListenerId {
        let id = uuid::Uuid::new_v4().to_string();
        let mut inner = self.inner.lock();
        inner
            .by_address
            .entry(address_id.clone())
            .or_default()
            .insert(id.clone());
        inner.by_id.insert(id.clone(), (address_id, callback));
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some((address_id, _)) = inner.by_id.remove(id) else {
            return false;
        };
        if let Some(ids) = inner.by_address.get_mut(&address_id) {
            ids.remove(id);
            if ids.is_empty() {
                inner.by_address.remove(&address_id);
            }
        }
        true
    }

    /// Remove every listener of an address; returns how many were removed.
    pub fn remove_address(&self, address_id: &AddressId) -> usize {
        let mut inner = self.inner.lock();
        let ids = inner.by_address.remove(address_id).unwrap_or_default();
        for id in &ids {
            inner.by_id.remove(id);
        }
        ids.len()
    }

    /// Listener ids registered for an address.
    pub fn listeners_for(&self, address_id: &AddressId) -> Vec<ListenerId> {
        self.inner
            .lock()
            .by_address
            .get(address_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback registered for the message's address.
    ///
    /// Callbacks are cloned under the lock and awaited outside it, so a
    /// callback may register or remove listeners. Returns the number invoked.
    pub async fn dispatch(&self, message: PushMessage) -> usize {
        let callbacks: Vec<Listener> = {
            let inner = self.inner.lock();
            inner
                .by_address
                .get(&message.address_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| inner.by_id.get(id).map(|(_, cb)| cb.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };
        for callback in &callbacks {
            callback(message.clone()).await;
        }
        callbacks.len()
    }
}

/// One-shot waiters keyed by address id.
#[derive(Default)]
pub struct ReadHandlerRegistry {
    waiters: Mutex<HashMap<AddressId, Vec<oneshot::Sender<Value>>>>,
}

impl ReadHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next value delivered for `address_id`.
    pub fn register(&self, address_id: AddressId) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().entry(address_id).or_default().push(tx);
        rx
    }

    /// Deliver a value to every waiter of `address_id`; returns how many
    /// waiters were still listening.
    pub fn resolve(&self, address_id: &AddressId, value: &Value) -> usize {
        let waiters = self.waiters.lock().remove(address_id).unwrap_or_default();
        waiters
            .into_iter()
            .filter_map(|tx| tx.send(value.clone()).ok())
            .count()
    }

    /// Drop every waiter of `address_id`.
    pub fn cancel(&self, address_id: &AddressId) {
        self.waiters.lock().remove(address_id);
    }

    /// Drop waiters whose receivers are gone.
    pub fn prune(&self) {
        let mut waiters = self.waiters.lock();
        for list in waiters.values_mut() {
            list.retain(|tx| !tx.is_closed());
        }
        waiters.retain(|_, list| !list.is_empty());
    }

    pub fn pending(&self, address_id: &AddressId) -> usize {
        self.waiters
            .lock()
            .get(address_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Address ids with at least one waiter.
    pub fn addresses(&self) -> Vec<AddressId> {
        self.waiters.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Protocol, TransportAddress};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn address_id(index: u16) -> AddressId {
        TransportAddress::parse(Protocol::Modbus, &format!("holding:{index}"))
            .unwrap()
            .id()
    }

    fn message(address_id: AddressId) -> PushMessage {
        PushMessage {
            address_id,
            topic: "t".into(),
            payload: Value::Int(1),
        }
    }

    #[tokio::test]
    async fn test_dispatch_reaches_only_matching_listeners() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let hits = hits.clone();
            registry.register(
                address_id(1),
                listener(move |_| {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            );
        }
        registry.register(address_id(2), listener(|_| async {}));

        assert_eq!(registry.dispatch(message(address_id(1))).await, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(registry.dispatch(message(address_id(3))).await, 0);
    }

    #[tokio::test]
    async fn test_remove_is_tolerant() {
        let registry = ListenerRegistry::new();
        let id = registry.register(address_id(1), listener(|_| async {}));
        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        assert!(!registry.remove("never-registered"));
        assert!(registry.listeners_for(&address_id(1)).is_empty());
        assert_eq!(registry.dispatch(message(address_id(1))).await, 0);
    }

    #[tokio::test]
    async fn test_callback_can_mutate_registry() {
        let registry = Arc::new(ListenerRegistry::new());
        let inner = registry.clone();
        registry.register(
            address_id(1),
            listener(move |_| {
                let inner = inner.clone();
                async move {
                    inner.register(address_id(9), listener(|_| async {}));
                }
            }),
        );
        registry.dispatch(message(address_id(1))).await;
        assert_eq!(registry.listeners_for(&address_id(9)).len(), 1);
    }

    #[tokio::test]
    async fn test_read_handlers_resolve_once() {
        let handlers = ReadHandlerRegistry::new();
        let rx = handlers.register(address_id(1));
        assert_eq!(handlers.pending(&address_id(1)), 1);

        assert_eq!(handlers.resolve(&address_id(1), &Value::Int(42)), 1);
        assert_eq!(rx.await.unwrap(), Value::Int(42));
        assert_eq!(handlers.resolve(&address_id(1), &Value::Int(43)), 0);
    }

    #[test]
    fn test_prune_drops_abandoned_waiters() {
        let handlers = ReadHandlerRegistry::new();
        drop(handlers.register(address_id(1)));
        let _kept = handlers.register(address_id(2));
        handlers.prune();
        assert_eq!(handlers.addresses(), vec![address_id(2)]);
    }
}
