use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use horde_api::{Record, TopicError};

use crate::subscription::{Feed, Subscription, SubscriptionRegistry};
use crate::{Topic, TopicFuture};

/// Topic handing each record to exactly one subscriber.
///
/// All subscribers consume the same bounded queue in FIFO order. Unless
/// created `from_beginning`, the topic discards what is produced before its
/// first subscription.
pub struct UnicastTopic<T> {
    from_beginning: bool,
    idle_timeout: Option<Duration>,
    closed: AtomicBool,
    subscribed: AtomicBool,
    tx: mpsc::Sender<Record<T>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Record<T>>>>,
    subscriptions: SubscriptionRegistry<T>,
    shutdown: CancellationToken,
}

impl<T> std::fmt::Debug for UnicastTopic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnicastTopic")
            .field("from_beginning", &self.from_beginning)
            .field("idle_timeout", &self.idle_timeout)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> UnicastTopic<T> {
    pub fn new(buffer_size: Option<usize>, from_beginning: bool, idle_timeout: Option<Duration>) -> Self {
        let capacity = buffer_size
            .unwrap_or(Semaphore::MAX_PERMITS)
            .clamp(1, Semaphore::MAX_PERMITS);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            from_beginning,
            idle_timeout,
            closed: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            subscriptions: SubscriptionRegistry::default(),
            shutdown: CancellationToken::new(),
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

impl<T: Clone + Send + Sync + 'static> Topic<T> for UnicastTopic<T> {
    fn subscribe<'a>(&'a self, subscriber: &'a str) -> TopicFuture<'a, Arc<Subscription<T>>> {
        Box::pin(async move {
            self.ensure_open()?;
            let subscription = self.subscriptions.get_or_insert_with(subscriber, || {
                Subscription::new(
                    subscriber,
                    Feed::Queue(Arc::clone(&self.rx)),
                    self.idle_timeout,
                    None,
                )
            });
            self.subscribed.store(true, Ordering::Release);
            Ok(subscription)
        })
    }

    fn produce(&self, record: Record<T>) -> TopicFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            if !self.from_beginning && !self.subscribed.load(Ordering::Acquire) {
                tracing::trace!("no subscriber yet, discarding record");
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Err(TopicError::Closed),
                sent = self.tx.send(record) => sent.map_err(|_| TopicError::Closed),
            }
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
        self.shutdown.cancel();
        self.subscriptions.cancel_all();
        tracing::debug!("unicast topic closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
