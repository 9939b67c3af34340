//! Per-key slots and the concurrent store that owns them.
//!
//! The map (DashMap, sharded) only hands out `Arc<Slot>`; every queue and
//! binding operation happens on the slot after the map guard is released, so
//! a waiting consumer never holds a map lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::binding::WebhookBinding;
use crate::bridge::protocol::RoutingKey;
use crate::webhook::WebhookInvoker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DequeueError {
    #[error("dequeue cancelled")]
    Cancelled,
}

/// FIFO queue, webhook binding and wakeup for one routing key.
#[derive(Default)]
pub struct Slot {
    queue: Mutex<VecDeque<Bytes>>,
    binding: OnceLock<WebhookBinding>,
    ready: Notify,
}

impl Slot {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        // A panic mid-push leaves the deque itself intact.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_back(&self, body: Bytes) {
        self.queue().push_back(body);
        self.ready.notify_one();
    }

    /// Put a body back at the head, ahead of everything enqueued since it was taken.
    pub fn requeue_front(&self, body: Bytes) {
        self.queue().push_front(body);
        self.ready.notify_one();
    }

    pub fn try_pop(&self) -> Option<Bytes> {
        let mut queue = self.queue();
        let body = queue.pop_front();
        if body.is_some() && !queue.is_empty() {
            // Chain the wakeup so a second waiter sees the remaining bodies.
            self.ready.notify_one();
        }
        body
    }

    /// Take the oldest body, waiting for one if the queue is empty.
    ///
    /// Cancellation never removes a body.
    pub async fn pop(&self, cancel: &CancellationToken) -> Result<Bytes, DequeueError> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            // Register before the check so a push between check and await still wakes us.
            notified.as_mut().enable();

            if let Some(body) = self.try_pop() {
                return Ok(body);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => {
                    if !self.is_empty() {
                        self.ready.notify_one();
                    }
                    return Err(DequeueError::Cancelled);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    pub fn binding(&self) -> Option<&WebhookBinding> {
        self.binding.get()
    }

    /// First binding wins; returns whether this call set it.
    pub fn bind(&self, binding: WebhookBinding) -> bool {
        self.binding.set(binding).is_ok()
    }
}

/// Concurrent key → slot mapping shared by every connection.
///
/// Slots are created on first reference and live for the life of the store.
pub struct SlotStore {
    slots: DashMap<RoutingKey, Arc<Slot>>,
    invoker: Arc<dyn WebhookInvoker>,
}

impl SlotStore {
    pub fn new(invoker: Arc<dyn WebhookInvoker>) -> Self {
        Self {
            slots: DashMap::new(),
            invoker,
        }
    }

    /// The slot for `key`, created if absent.
    pub fn slot(&self, key: &RoutingKey) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(&slot);
        }
        Arc::clone(&self.slots.entry(*key).or_default())
    }

    pub fn get(&self, key: &RoutingKey) -> Option<Arc<Slot>> {
        self.slots.get(key).map(|slot| Arc::clone(&slot))
    }

    /// Append a body to the key's queue and fire its webhook if bound.
    pub fn enqueue(&self, key: &RoutingKey, body: Bytes) {
        let slot = self.slot(key);
        slot.push_back(body);
        tracing::trace!(%key, depth = slot.len(), "Enqueued body");

        if let Some(binding) = slot.binding() {
            self.fire(key, binding);
        }
    }

    /// Remove and return the oldest body for `key`, waiting until one arrives or `cancel` fires.
    pub async fn dequeue(
        &self,
        key: &RoutingKey,
        cancel: &CancellationToken,
    ) -> Result<Bytes, DequeueError> {
        let slot = self.slot(key);
        slot.pop(cancel).await
    }

    /// Return a dequeued body that could not be delivered.
    pub fn requeue(&self, key: &RoutingKey, body: Bytes) {
        tracing::debug!(%key, body_size = body.len(), "Requeueing undelivered body");
        self.slot(key).requeue_front(body);
    }

    /// Bind a webhook to `key` unless one is already bound.
    ///
    /// A successful bind fires the webhook once immediately.
    pub fn bind_webhook(&self, key: &RoutingKey, binding: WebhookBinding) -> bool {
        let slot = self.slot(key);
        if !slot.bind(binding) {
            tracing::debug!(%key, "Webhook already bound, keeping first registration");
            return false;
        }

        if let Some(binding) = slot.binding() {
            tracing::info!(%key, url = %binding.url(), "Webhook bound");
            self.fire(key, binding);
        }
        true
    }

    fn fire(&self, key: &RoutingKey, binding: &WebhookBinding) {
        tracing::debug!(%key, url = %binding.url(), "Firing webhook");
        self.invoker.post(binding.url(), binding.payload().to_string());
    }

    /// Number of keys seen so far.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::webhook::testing::RecordingInvoker;

    fn store() -> (Arc<SlotStore>, Arc<RecordingInvoker>) {
        let invoker = Arc::new(RecordingInvoker::default());
        (Arc::new(SlotStore::new(invoker.clone())), invoker)
    }

    fn key(n: u8) -> RoutingKey {
        RoutingKey::new([n; 32])
    }

    #[tokio::test]
    async fn fifo_within_key() {
        let (store, _) = store();
        let cancel = CancellationToken::new();

        for i in 0..10u8 {
            store.enqueue(&key(1), Bytes::from(vec![i]));
        }
        for i in 0..10u8 {
            let body = store.dequeue(&key(1), &cancel).await.unwrap();
            assert_eq!(&body[..], &[i]);
        }
        assert!(store.slot(&key(1)).is_empty());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (store, _) = store();
        let cancel = CancellationToken::new();

        store.enqueue(&key(1), Bytes::from_static(b"one"));
        store.enqueue(&key(2), Bytes::from_static(b"two"));

        assert_eq!(store.dequeue(&key(2), &cancel).await.unwrap(), "two");
        assert_eq!(store.dequeue(&key(1), &cancel).await.unwrap(), "one");
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn dequeue_waits_for_enqueue() {
        let (store, _) = store();
        let cancel = CancellationToken::new();

        let waiter = {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            tokio::spawn(async move { store.dequeue(&key(3), &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        store.enqueue(&key(3), Bytes::from_static(b"late"));
        let body = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(body, "late");
    }

    #[tokio::test]
    async fn cancelled_dequeue_loses_nothing() {
        let (store, _) = store();
        let cancel = CancellationToken::new();

        let waiter = {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            tokio::spawn(async move { store.dequeue(&key(4), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap(), Err(DequeueError::Cancelled));

        store.enqueue(&key(4), Bytes::from_static(b"kept"));
        let fresh = CancellationToken::new();
        assert_eq!(store.dequeue(&key(4), &fresh).await.unwrap(), "kept");
    }

    #[tokio::test]
    async fn requeue_goes_to_front() {
        let (store, _) = store();
        let cancel = CancellationToken::new();

        store.enqueue(&key(5), Bytes::from_static(b"a"));
        store.enqueue(&key(5), Bytes::from_static(b"b"));

        let first = store.dequeue(&key(5), &cancel).await.unwrap();
        store.requeue(&key(5), first);

        assert_eq!(store.dequeue(&key(5), &cancel).await.unwrap(), "a");
        assert_eq!(store.dequeue(&key(5), &cancel).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn each_waiter_gets_one_body() {
        let (store, _) = store();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    store.dequeue(&key(6), &cancel).await.unwrap()
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..4u8 {
            store.enqueue(&key(6), Bytes::from(vec![i]));
        }

        let mut seen = HashSet::new();
        for waiter in waiters {
            let body = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert!(seen.insert(body[0]));
        }
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_and_consumers_deliver_exactly_once() {
        const PRODUCERS: u32 = 4;
        const PER_TASK: u32 = 1000;

        let (store, _) = store();

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for i in 0..PER_TASK {
                        let id = p * PER_TASK + i;
                        store.enqueue(&key(7), Bytes::from(id.to_be_bytes().to_vec()));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        let consumers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    let mut got = Vec::with_capacity(PER_TASK as usize);
                    for _ in 0..PER_TASK {
                        let body = store.dequeue(&key(7), &cancel).await.unwrap();
                        got.push(u32::from_be_bytes([body[0], body[1], body[2], body[3]]));
                    }
                    got
                })
            })
            .collect();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }

        all.sort_unstable();
        let expected: Vec<u32> = (0..PRODUCERS * PER_TASK).collect();
        assert_eq!(all, expected);
        assert!(store.slot(&key(7)).is_empty());
    }

    #[tokio::test]
    async fn first_binding_wins_and_fires_on_bind() {
        let (store, invoker) = store();

        assert!(store.bind_webhook(&key(8), WebhookBinding::new("http://first/", "{\"n\":1}")));
        assert!(!store.bind_webhook(&key(8), WebhookBinding::new("http://second/", "{\"n\":2}")));

        let slot = store.slot(&key(8));
        assert_eq!(slot.binding().unwrap().url(), "http://first/");
        assert_eq!(
            invoker.posts(),
            vec![("http://first/".to_string(), "{\"n\":1}".to_string())]
        );
    }

    #[tokio::test]
    async fn enqueue_fires_bound_webhook() {
        let (store, invoker) = store();

        store.enqueue(&key(9), Bytes::from_static(b"unbound"));
        assert!(invoker.posts().is_empty());

        store.bind_webhook(&key(9), WebhookBinding::new("http://hook/", "{}"));
        store.enqueue(&key(9), Bytes::from_static(b"bound"));

        assert_eq!(invoker.posts().len(), 2);
        assert_eq!(store.slot(&key(9)).len(), 2);
    }
}
