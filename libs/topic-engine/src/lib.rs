//! In-process publish/subscribe used to pass data between the branches of a
//! scenario graph.

pub mod broadcast;
pub mod config;
pub mod looping;
pub mod subscription;
pub mod unicast;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use horde_api::{Record, TopicError};

pub use broadcast::BroadcastTopic;
pub use config::{DEFAULT_REPLAY_BUFFER, TopicConfig, TopicMode};
pub use looping::LoopTopic;
pub use subscription::Subscription;
pub use unicast::UnicastTopic;

pub type TopicFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TopicError>> + Send + 'a>>;

// ═══════════════════════════════════════════════════════════════
//  Topic
// ═══════════════════════════════════════════════════════════════

/// Named channel of records between producers and subscribers.
///
/// Every operation on a closed topic fails with [`TopicError::Closed`].
pub trait Topic<T: Send + 'static>: Send + Sync {
    /// Subscription of `subscriber`, created on first call. Calling again
    /// with the same id returns the same active subscription.
    fn subscribe<'a>(&'a self, subscriber: &'a str) -> TopicFuture<'a, Arc<Subscription<T>>>;

    /// Publish a record. Suspends while a bounded buffer is full.
    fn produce(&self, record: Record<T>) -> TopicFuture<'_, ()>;

    fn produce_value(&self, value: T) -> TopicFuture<'_, ()> {
        self.produce(Record::new(value))
    }

    /// Next record for `subscriber`, suspending until one is available.
    fn poll<'a>(&'a self, subscriber: &'a str) -> TopicFuture<'a, Record<T>>;

    fn poll_value<'a>(&'a self, subscriber: &'a str) -> TopicFuture<'a, T> {
        Box::pin(async move { self.poll(subscriber).await.map(Record::into_value) })
    }

    /// Cancel the subscription of `subscriber`, if any.
    fn cancel(&self, subscriber: &str);

    /// Cancel all subscriptions and reject any further operation.
    fn close(&self);

    fn is_closed(&self) -> bool;
}
