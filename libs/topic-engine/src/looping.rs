use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Notify;

use horde_api::{Record, TopicError};

use crate::subscription::{Feed, Subscription, SubscriptionRegistry, lock, read, write};
use crate::{Topic, TopicFuture};

/// Every record produced so far, shared by all the cursors of a [`LoopTopic`].
pub(crate) struct LoopLog<T> {
    records: RwLock<Vec<Record<T>>>,
    completed: AtomicBool,
    appended: Notify,
}

pub(crate) struct LoopCursor<T> {
    log: Arc<LoopLog<T>>,
    position: Mutex<usize>,
}

impl<T: Clone> LoopCursor<T> {
    fn new(log: Arc<LoopLog<T>>) -> Self {
        Self {
            log,
            position: Mutex::new(0),
        }
    }

    /// Next record of the log; wraps to the first one once the log is complete.
    pub(crate) async fn next(&self) -> Record<T> {
        loop {
            // Registered before checking, so an append in between is not missed.
            let appended = self.log.appended.notified();
            if let Some(record) = self.advance() {
                return record;
            }
            appended.await;
        }
    }

    fn advance(&self) -> Option<Record<T>> {
        let records = read(&self.log.records);
        let mut position = lock(&self.position);
        if *position >= records.len() {
            if records.is_empty() || !self.log.completed.load(Ordering::Acquire) {
                return None;
            }
            *position = 0;
        }
        let record = records[*position].clone();
        *position += 1;
        Some(record)
    }
}

/// Topic recording everything it receives and, once completed, replaying
/// the whole sequence again and again to every subscriber.
///
/// Each subscriber reads from the first record on, independently of the
/// others.
pub struct LoopTopic<T> {
    idle_timeout: Option<Duration>,
    closed: AtomicBool,
    log: Arc<LoopLog<T>>,
    subscriptions: SubscriptionRegistry<T>,
}

impl<T> std::fmt::Debug for LoopTopic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopTopic")
            .field("idle_timeout", &self.idle_timeout)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("completed", &self.log.completed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> LoopTopic<T> {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            idle_timeout,
            closed: AtomicBool::new(false),
            log: Arc::new(LoopLog {
                records: RwLock::new(Vec::new()),
                completed: AtomicBool::new(false),
                appended: Notify::new(),
            }),
            subscriptions: SubscriptionRegistry::default(),
        }
    }

    /// Mark the sequence as complete: subscribers reaching its end start over.
    pub fn complete(&self) {
        self.log.completed.store(true, Ordering::Release);
        self.log.appended.notify_waiters();
        tracing::debug!(records = read(&self.log.records).len(), "loop topic completed");
    }

    pub fn is_completed(&self) -> bool {
        self.log.completed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), TopicError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TopicError::Closed)
        } else {
            Ok(())
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Topic<T> for LoopTopic<T> {
    fn subscribe<'a>(&'a self, subscriber: &'a str) -> TopicFuture<'a, Arc<Subscription<T>>> {
        Box::pin(async move {
            self.ensure_open()?;
            Ok(self.subscriptions.get_or_insert_with(subscriber, || {
                let cursor = LoopCursor::new(Arc::clone(&self.log));
                Subscription::new(subscriber, Feed::Replay(cursor), self.idle_timeout, None)
            }))
        })
    }

    fn produce(&self, record: Record<T>) -> TopicFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            write(&self.log.records).push(record);
            self.log.appended.notify_waiters();
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
        tracing::debug!("loop topic closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
