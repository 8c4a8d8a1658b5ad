use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use horde_api::{Record, TopicError};

use crate::looping::LoopCursor;

pub(crate) type CancelCallback = Box<dyn FnOnce() + Send>;

// ═══════════════════════════════════════════════════════════════
//  Feed — where a subscription takes its records from
// ═══════════════════════════════════════════════════════════════

pub(crate) enum Feed<T> {
    /// Bounded queue, either dedicated to the subscriber (broadcast) or
    /// shared by every subscriber of the topic (unicast).
    Queue(Arc<tokio::sync::Mutex<mpsc::Receiver<Record<T>>>>),
    /// Own cursor over a replayable log.
    Replay(LoopCursor<T>),
}

impl<T: Clone> Feed<T> {
    pub(crate) fn dedicated(rx: mpsc::Receiver<Record<T>>) -> Self {
        Feed::Queue(Arc::new(tokio::sync::Mutex::new(rx)))
    }

    /// Next record, `None` once the producing side is gone.
    async fn next(&self) -> Option<Record<T>> {
        match self {
            Feed::Queue(rx) => rx.lock().await.recv().await,
            Feed::Replay(cursor) => Some(cursor.next().await),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Subscription
// ═══════════════════════════════════════════════════════════════

/// Cursor of one subscriber on a topic.
///
/// A subscription is active until it is cancelled, either explicitly, by
/// the topic being closed or by its idle timer: when no poll starts or
/// completes within the idle timeout (and none is pending), it cancels
/// itself. Cancellation is terminal.
pub struct Subscription<T> {
    subscriber: String,
    feed: Feed<T>,
    idle_timeout: Option<Duration>,
    active: AtomicBool,
    token: CancellationToken,
    activity: Arc<Notify>,
    polling: Arc<AtomicUsize>,
    on_cancel: Mutex<Option<CancelCallback>>,
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subscriber", &self.subscriber)
            .field("idle_timeout", &self.idle_timeout)
            .field("active", &self.is_active())
            .finish()
    }
}

impl<T> Subscription<T> {
    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Cancel the subscription. Only the first call has an effect.
    pub fn cancel(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        let callback = lock(&self.on_cancel).take();
        if let Some(callback) = callback {
            callback();
        }
        tracing::debug!(subscriber = %self.subscriber, "subscription cancelled");
    }

    /// Token cancelled together with the subscription.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn cancelled_error(&self) -> TopicError {
        TopicError::CancelledSubscription(self.subscriber.clone())
    }
}

impl<T: Clone + Send + Sync + 'static> Subscription<T> {
    pub(crate) fn new(
        subscriber: &str,
        feed: Feed<T>,
        idle_timeout: Option<Duration>,
        on_cancel: Option<CancelCallback>,
    ) -> Arc<Self> {
        let subscription = Arc::new(Self {
            subscriber: subscriber.to_owned(),
            feed,
            idle_timeout: idle_timeout.filter(|idle| !idle.is_zero()),
            active: AtomicBool::new(true),
            token: CancellationToken::new(),
            activity: Arc::new(Notify::new()),
            polling: Arc::new(AtomicUsize::new(0)),
            on_cancel: Mutex::new(on_cancel),
        });
        if let Some(idle) = subscription.idle_timeout {
            watch_idleness(&subscription, idle);
        }
        subscription
    }

    /// Wait for the next record.
    ///
    /// Fails with [`TopicError::CancelledSubscription`] when the subscription
    /// is cancelled before or while waiting.
    pub async fn poll(&self) -> Result<Record<T>, TopicError> {
        if !self.is_active() {
            return Err(self.cancelled_error());
        }
        self.activity.notify_one();
        let _polling = PollingGuard::enter(&self.polling);

        let received = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            record = self.feed.next() => record,
        };

        match received {
            Some(record) => {
                self.activity.notify_one();
                Ok(record)
            }
            None => {
                self.cancel();
                Err(self.cancelled_error())
            }
        }
    }

    pub async fn poll_value(&self) -> Result<T, TopicError> {
        self.poll().await.map(Record::into_value)
    }

    /// Spawn a task passing every record to `handler` until the subscription
    /// is cancelled.
    pub fn on_receive<F>(self: &Arc<Self>, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(Record<T>) + Send + 'static,
    {
        let subscription = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(record) = subscription.poll().await {
                handler(record);
            }
            tracing::trace!(subscriber = %subscription.subscriber, "stopped consuming subscription");
        })
    }

    pub fn on_receive_value<F>(self: &Arc<Self>, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(T) + Send + 'static,
    {
        self.on_receive(move |record| handler(record.value))
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        // Stops the idle timer of subscriptions nobody cancelled.
        self.token.cancel();
    }
}

struct PollingGuard<'a>(&'a AtomicUsize);

impl<'a> PollingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PollingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-subscription expiry timer, re-armed by every poll.
fn watch_idleness<T: Clone + Send + Sync + 'static>(subscription: &Arc<Subscription<T>>, idle: Duration) {
    let token = subscription.token.clone();
    let activity = Arc::clone(&subscription.activity);
    let polling = Arc::clone(&subscription.polling);
    let subscription = Arc::downgrade(subscription);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = activity.notified() => continue,
                _ = tokio::time::sleep(idle) => {
                    if polling.load(Ordering::Acquire) > 0 {
                        continue;
                    }
                    if let Some(subscription) = subscription.upgrade() {
                        tracing::debug!(
                            subscriber = %subscription.subscriber,
                            idle_ms = idle.as_millis() as u64,
                            "subscription idle for too long"
                        );
                        subscription.cancel();
                    }
                    return;
                }
            }
        }
    });
}

// ═══════════════════════════════════════════════════════════════
//  SubscriptionRegistry — subscriptions of one topic, by subscriber id
// ═══════════════════════════════════════════════════════════════

pub(crate) struct SubscriptionRegistry<T> {
    entries: RwLock<HashMap<String, Arc<Subscription<T>>>>,
}

impl<T> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> SubscriptionRegistry<T> {
    /// Registered subscription, active or not.
    pub(crate) fn get(&self, subscriber: &str) -> Result<Arc<Subscription<T>>, TopicError> {
        read(&self.entries)
            .get(subscriber)
            .cloned()
            .ok_or_else(|| TopicError::UnknownSubscription(subscriber.to_owned()))
    }

    pub(crate) fn active(&self, subscriber: &str) -> Option<Arc<Subscription<T>>> {
        read(&self.entries)
            .get(subscriber)
            .filter(|subscription| subscription.is_active())
            .cloned()
    }

    /// Return the active subscription of `subscriber`, registering the one
    /// built by `create` when there is none.
    pub(crate) fn get_or_insert_with(
        &self,
        subscriber: &str,
        create: impl FnOnce() -> Arc<Subscription<T>>,
    ) -> Arc<Subscription<T>> {
        let mut entries = write(&self.entries);
        if let Some(existing) = entries.get(subscriber).filter(|s| s.is_active()) {
            return Arc::clone(existing);
        }
        let subscription = create();
        entries.insert(subscriber.to_owned(), Arc::clone(&subscription));
        tracing::debug!(subscriber, "subscription registered");
        subscription
    }

    /// Register `subscription`, replacing a cancelled one with the same id.
    pub(crate) fn insert(&self, subscription: Arc<Subscription<T>>) {
        write(&self.entries).insert(subscription.subscriber.clone(), subscription);
    }

    pub(crate) fn cancel(&self, subscriber: &str) {
        let subscription = read(&self.entries).get(subscriber).cloned();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    pub(crate) fn cancel_all(&self) {
        let subscriptions: Vec<_> = read(&self.entries).values().cloned().collect();
        for subscription in subscriptions {
            subscription.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Lock helpers: a poisoned lock is recovered, the guarded state stays usable.
// ---------------------------------------------------------------------------

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("topic mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("topic read lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("topic write lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Remove the entry of `subscriber` from a fan-out table, unless it has been
/// replaced by a newer subscription in the meantime.
pub(crate) fn detach<O>(
    table: &Weak<Mutex<HashMap<String, (u64, O)>>>,
    subscriber: &str,
    serial: u64,
) {
    let Some(table) = table.upgrade() else {
        return;
    };
    let mut table = lock(&table);
    if table.get(subscriber).is_some_and(|(current, _)| *current == serial) {
        table.remove(subscriber);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_subscription(
        idle: Option<Duration>,
    ) -> (mpsc::Sender<Record<u32>>, Arc<Subscription<u32>>) {
        let (tx, rx) = mpsc::channel(8);
        let subscription = Subscription::new("sub", Feed::dedicated(rx), idle, None);
        (tx, subscription)
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_runs_callback_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (_tx, rx) = mpsc::channel::<Record<u32>>(1);
        let subscription = Subscription::new(
            "sub",
            Feed::dedicated(rx),
            None,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        subscription.cancel();
        subscription.cancel();

        assert!(!subscription.is_active());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            subscription.poll().await.unwrap_err(),
            TopicError::CancelledSubscription("sub".into())
        );
    }

    #[tokio::test]
    async fn pending_poll_fails_on_cancellation() {
        let (_tx, subscription) = queue_subscription(None);
        let pending = {
            let subscription = Arc::clone(&subscription);
            tokio::spawn(async move { subscription.poll().await })
        };
        tokio::task::yield_now().await;

        subscription.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TopicError::CancelledSubscription(_))));
    }

    #[tokio::test]
    async fn dropped_producer_cancels_subscription() {
        let (tx, subscription) = queue_subscription(None);
        tx.send(Record::new(1)).await.unwrap();
        drop(tx);

        assert_eq!(subscription.poll_value().await.unwrap(), 1);
        assert!(subscription.poll().await.is_err());
        assert!(!subscription.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_subscription_cancels_itself() {
        let (_tx, subscription) = queue_subscription(Some(Duration::from_millis(20)));

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!subscription.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn polling_keeps_subscription_alive() {
        let (tx, subscription) = queue_subscription(Some(Duration::from_millis(50)));

        for i in 0..5 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tx.send(Record::new(i)).await.unwrap();
            assert_eq!(subscription.poll_value().await.unwrap(), i);
        }
        assert!(subscription.is_active());

        // A poll waiting for data is not idleness.
        let waiting = {
            let subscription = Arc::clone(&subscription);
            tokio::spawn(async move { subscription.poll_value().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(subscription.is_active());

        tx.send(Record::new(99)).await.unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), 99);
    }

    #[tokio::test]
    async fn zero_idle_timeout_disables_expiry() {
        let (_tx, subscription) = queue_subscription(Some(Duration::ZERO));
        assert_eq!(subscription.idle_timeout(), None);
    }

    #[tokio::test]
    async fn on_receive_value_drains_until_cancelled() {
        let (tx, subscription) = queue_subscription(None);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let consumer = subscription.on_receive_value(move |value| {
            let _ = seen_tx.send(value);
        });

        for i in 0..3 {
            tx.send(Record::new(i)).await.unwrap();
        }
        for i in 0..3 {
            assert_eq!(seen_rx.recv().await, Some(i));
        }

        subscription.cancel();
        tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn detach_ignores_replaced_entries() {
        let table = Arc::new(Mutex::new(HashMap::from([("sub".to_owned(), (2u64, ()))])));
        let weak = Arc::downgrade(&table);

        detach(&weak, "sub", 1);
        assert!(lock(&table).contains_key("sub"));

        detach(&weak, "sub", 2);
        assert!(lock(&table).is_empty());
    }
}
