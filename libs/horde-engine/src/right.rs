use std::fmt;
use std::sync::Arc;

use horde_api::{CorrelationRecord, StepName};
use topic_engine::Topic;

/// Extracts the correlation key of a record; `None` when it has none.
pub type KeyExtractor<T, K> = Arc<dyn Fn(&CorrelationRecord<T>) -> Option<K> + Send + Sync>;

/// Secondary input of an [`InnerJoinStep`](crate::InnerJoinStep): the topic
/// fed by step `source` and how to key its records.
pub struct RightCorrelation<K, R> {
    pub source: StepName,
    pub topic: Arc<dyn Topic<CorrelationRecord<R>>>,
    pub key_extractor: KeyExtractor<R, K>,
}

impl<K, R: Send + 'static> RightCorrelation<K, R> {
    pub fn new<F>(source: impl Into<StepName>, topic: Arc<dyn Topic<CorrelationRecord<R>>>, key_extractor: F) -> Self
    where
        F: Fn(&CorrelationRecord<R>) -> Option<K> + Send + Sync + 'static,
    {
        Self {
            source: source.into(),
            topic,
            key_extractor: Arc::new(key_extractor),
        }
    }
}

impl<K, R> Clone for RightCorrelation<K, R> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            topic: Arc::clone(&self.topic),
            key_extractor: Arc::clone(&self.key_extractor),
        }
    }
}

impl<K, R> fmt::Debug for RightCorrelation<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RightCorrelation")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Secondary input of a [`ZipLastStep`](crate::ZipLastStep).
pub struct RightSource<R> {
    pub source: StepName,
    pub topic: Arc<dyn Topic<CorrelationRecord<R>>>,
}

impl<R> RightSource<R> {
    pub fn new(source: impl Into<StepName>, topic: Arc<dyn Topic<CorrelationRecord<R>>>) -> Self {
        Self {
            source: source.into(),
            topic,
        }
    }
}

impl<R> Clone for RightSource<R> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            topic: Arc::clone(&self.topic),
        }
    }
}

impl<R> fmt::Debug for RightSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RightSource")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
