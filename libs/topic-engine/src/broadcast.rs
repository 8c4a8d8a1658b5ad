use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use horde_api::{Record, TopicError};

use crate::subscription::{Feed, Subscription, SubscriptionRegistry, detach, lock};
use crate::{Topic, TopicFuture};

/// Sending half of one subscriber's channel.
struct Outlet<T> {
    tx: mpsc::Sender<Record<T>>,
    token: CancellationToken,
}

impl<T> Clone for Outlet<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            token: self.token.clone(),
        }
    }
}

impl<T> Outlet<T> {
    /// Wait for room in the subscriber's buffer, unless it gets cancelled.
    async fn deliver(&self, record: Record<T>) {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {}
            sent = self.tx.send(record) => {
                if sent.is_err() {
                    tracing::trace!("subscriber channel closed, record not delivered");
                }
            }
        }
    }
}

type Outlets<T> = Arc<Mutex<HashMap<String, (u64, Outlet<T>)>>>;

/// Drop-oldest buffer of the latest records, replayed to new subscribers.
struct ReplayBuffer<T> {
    capacity: usize,
    records: VecDeque<Record<T>>,
}

impl<T> ReplayBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    fn push(&mut self, record: Record<T>) {
        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }
}

/// Topic delivering every record to every subscriber.
///
/// Each subscriber owns a bounded channel; a full channel blocks the
/// producer until the subscriber polls. With a replay capacity, the latest
/// records are kept and delivered first to any new subscriber, which then
/// continues with the live stream.
pub struct BroadcastTopic<T> {
    channel_capacity: usize,
    idle_timeout: Option<Duration>,
    closed: AtomicBool,
    subscriptions: SubscriptionRegistry<T>,
    outlets: Outlets<T>,
    /// Taken before `outlets` whenever both are needed. Never held across
    /// an await, so registration does not wait for a blocked delivery.
    replay: Mutex<ReplayBuffer<T>>,
    /// Serializes producers, so every subscriber sees the same order.
    producing: tokio::sync::Mutex<()>,
    serial: AtomicU64,
}

impl<T> std::fmt::Debug for BroadcastTopic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastTopic")
            .field("channel_capacity", &self.channel_capacity)
            .field("idle_timeout", &self.idle_timeout)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> BroadcastTopic<T> {
    /// - `buffer_size`: capacity of each subscriber channel, `None` for unlimited
    /// - `replay`: number of latest records replayed to new subscribers, `0` for none
    pub fn new(buffer_size: Option<usize>, replay: usize, idle_timeout: Option<Duration>) -> Self {
        let channel_capacity = buffer_size
            .unwrap_or(Semaphore::MAX_PERMITS)
            .max(replay)
            .max(1)
            .min(Semaphore::MAX_PERMITS);
        Self {
            channel_capacity,
            idle_timeout,
            closed: AtomicBool::new(false),
            subscriptions: SubscriptionRegistry::default(),
            outlets: Arc::new(Mutex::new(HashMap::new())),
            replay: Mutex::new(ReplayBuffer::new(replay)),
            producing: tokio::sync::Mutex::new(()),
            serial: AtomicU64::new(0),
        }
    }

    fn ensure_open(&self) -> Result<(), TopicError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TopicError::Closed)
        } else {
            Ok(())
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Topic<T> for BroadcastTopic<T> {
    fn subscribe<'a>(&'a self, subscriber: &'a str) -> TopicFuture<'a, Arc<Subscription<T>>> {
        Box::pin(async move {
            self.ensure_open()?;
            if let Some(existing) = self.subscriptions.active(subscriber) {
                return Ok(existing);
            }

            // Registered under the replay lock: the subscriber gets each record
            // once, either from the replay or from the live stream.
            let replay = lock(&self.replay);
            if let Some(existing) = self.subscriptions.active(subscriber) {
                return Ok(existing);
            }
            self.ensure_open()?;

            let (tx, rx) = mpsc::channel(self.channel_capacity);
            for record in &replay.records {
                // Cannot fail: the channel holds at least the replay capacity.
                if tx.try_send(record.clone()).is_err() {
                    break;
                }
            }

            let serial = self.serial.fetch_add(1, Ordering::Relaxed);
            let outlets = Arc::downgrade(&self.outlets);
            let id = subscriber.to_owned();
            let subscription = Subscription::new(
                subscriber,
                Feed::dedicated(rx),
                self.idle_timeout,
                Some(Box::new(move || detach(&outlets, &id, serial))),
            );
            let outlet = Outlet {
                tx,
                token: subscription.cancellation_token(),
            };
            lock(&self.outlets).insert(subscriber.to_owned(), (serial, outlet));
            self.subscriptions.insert(Arc::clone(&subscription));

            tracing::debug!(
                subscriber,
                replayed = replay.records.len(),
                "broadcast subscription registered"
            );
            Ok(subscription)
        })
    }

    fn produce(&self, record: Record<T>) -> TopicFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let _producing = self.producing.lock().await;
            let outlets: Vec<Outlet<T>> = {
                let mut replay = lock(&self.replay);
                let outlets = lock(&self.outlets)
                    .values()
                    .map(|(_, outlet)| outlet.clone())
                    .collect();
                replay.push(record.clone());
                outlets
            };
            for outlet in &outlets {
                outlet.deliver(record.clone()).await;
            }
            Ok(())
        })
    }

    fn poll<'a>(&'a self, subscriber: &'a str) -> TopicFuture<'a, Record<T>> {
        Box::pin(async move {
            self.ensure_open()?;
            let subscription = self.subscriptions.get(subscriber)?;
            subscription.poll().await
        })
    }

    fn cancel(&self, subscriber: &str) {
        self.subscriptions.cancel(subscriber);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.subscriptions.cancel_all();
        lock(&self.outlets).clear();
        tracing::debug!("broadcast topic closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
