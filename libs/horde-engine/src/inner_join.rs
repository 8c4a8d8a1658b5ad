use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use horde_api::{CorrelationRecord, Step, StepContext, StepError, StepFuture, StepName, StepStartStopContext};
use topic_engine::Subscription;

use crate::correlation::{CorrelatedValues, CorrelationCache, Completion, Lookup};
use crate::lock;
use crate::right::{KeyExtractor, RightCorrelation};

/// Builds the output of a join from the primary value and the secondary
/// values by source.
pub type Combiner<I, R, O> = Box<dyn Fn(I, CorrelatedValues<R>) -> O + Send + Sync>;

/// Step joining the primary value of each minion with one value of every
/// secondary source sharing its correlation key.
///
/// The secondary topics are consumed in the background from `start()` to
/// `stop()`. A primary execution either finds every secondary value already
/// cached, or waits for the missing ones up to the cache timeout. A primary
/// value without key is ignored.
pub struct InnerJoinStep<I, K, R, O> {
    name: StepName,
    runtime: Handle,
    left_key_extractor: KeyExtractor<I, K>,
    right_correlations: Vec<RightCorrelation<K, R>>,
    combiner: Combiner<I, R, O>,
    cache: Arc<CorrelationCache<K, R>>,
    running: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl<I, K, R, O> std::fmt::Debug for InnerJoinStep<I, K, R, O>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerJoinStep")
            .field("name", &self.name)
            .field("right_correlations", &self.right_correlations)
            .field("cache", &self.cache)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<I, K, R, O> InnerJoinStep<I, K, R, O>
where
    I: Send + 'static,
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    /// - `runtime`: where the secondary topics are consumed
    /// - `cache_timeout`: how long a primary waits for missing values, and
    ///   how long unclaimed values are kept; zero for unlimited
    pub fn new<L, C>(
        name: impl Into<StepName>,
        runtime: Handle,
        left_key_extractor: L,
        right_correlations: Vec<RightCorrelation<K, R>>,
        cache_timeout: Duration,
        combiner: C,
    ) -> Self
    where
        L: Fn(&CorrelationRecord<I>) -> Option<K> + Send + Sync + 'static,
        C: Fn(I, CorrelatedValues<R>) -> O + Send + Sync + 'static,
    {
        let cache = CorrelationCache::new(right_correlations.len(), Some(cache_timeout));
        Self {
            name: name.into(),
            runtime,
            left_key_extractor: Arc::new(left_key_extractor),
            right_correlations,
            combiner: Box::new(combiner),
            cache: Arc::new(cache),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn has_key_in_cache(&self, key: &K) -> bool {
        self.cache.contains_key(key)
    }

    pub fn is_cache_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn spawn_consumer(
        &self,
        correlation: RightCorrelation<K, R>,
        subscription: Arc<Subscription<CorrelationRecord<R>>>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let step = self.name.clone();
        self.runtime.spawn(async move {
            let source = &correlation.source;
            tracing::debug!(step = %step, source = %source, "right consumer started");
            loop {
                let record = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    polled = subscription.poll_value() => match polled {
                        Ok(record) => record,
                        Err(e) => {
                            tracing::debug!(step = %step, source = %source, error = %e, "right subscription ended");
                            break;
                        }
                    },
                };
                match (correlation.key_extractor)(&record) {
                    Some(key) => {
                        tracing::trace!(step = %step, source = %source, key = ?key, "caching right record");
                        cache.offer(key, source, record.value);
                    }
                    None => {
                        tracing::trace!(step = %step, source = %source, "right record without key, ignored");
                    }
                }
            }
            tracing::debug!(step = %step, source = %source, "right consumer stopped");
        })
    }

    fn spawn_sweeper(&self, timeout: Duration, token: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let step = self.name.clone();
        self.runtime.spawn(async move {
            let mut ticks = tokio::time::interval((timeout / 2).max(Duration::from_millis(1)));
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {
                        let evicted = cache.evict_expired();
                        if evicted > 0 {
                            tracing::debug!(step = %step, evicted, "expired correlation entries evicted");
                        }
                    }
                }
            }
        })
    }
}

impl<I, K, R, O> Step<I, O> for InnerJoinStep<I, K, R, O>
where
    I: Send + 'static,
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn start<'a>(&'a self, _ctx: &'a StepStartStopContext) -> StepFuture<'a> {
        Box::pin(async move {
            if self.is_running() {
                return Ok(());
            }
            let token = CancellationToken::new();
            let mut consumers = Vec::with_capacity(self.right_correlations.len() + 1);
            for correlation in &self.right_correlations {
                let subscription = match correlation.topic.subscribe(&self.name).await {
                    Ok(subscription) => subscription,
                    Err(e) => {
                        token.cancel();
                        return Err(e.into());
                    }
                };
                consumers.push(self.spawn_consumer(correlation.clone(), subscription, token.clone()));
            }
            if let Some(timeout) = self.cache.timeout() {
                consumers.push(self.spawn_sweeper(timeout, token.clone()));
            }

            *lock(&self.shutdown) = token;
            lock(&self.consumers).extend(consumers);
            self.running.store(true, Ordering::Release);
            tracing::debug!(
                step = %self.name,
                sources = self.right_correlations.len(),
                "inner join started"
            );
            Ok(())
        })
    }

    fn execute<'a>(&'a self, ctx: &'a mut StepContext<I, O>) -> StepFuture<'a> {
        Box::pin(async move {
            if !self.is_running() {
                return Err(StepError::NotInitialized(self.name.clone()));
            }
            let input = ctx.receive()?;
            let source = ctx.previous_step.clone().unwrap_or_default();
            let left = CorrelationRecord::new(ctx.minion_id.clone(), source, input);

            let Some(key) = (self.left_key_extractor)(&left) else {
                tracing::trace!(step = %self.name, minion = %ctx.minion_id, "no correlation key, nothing to join");
                return Ok(());
            };

            let values = match self.cache.lookup(key.clone()) {
                Lookup::Ready(values) => values,
                Lookup::Pending(pending) => {
                    let token = ctx.cancellation().clone();
                    match self.cache.wait(&key, pending, &token).await {
                        Completion::Complete(values) => values,
                        Completion::TimedOut(timeout) => {
                            tracing::warn!(
                                step = %self.name,
                                minion = %ctx.minion_id,
                                key = ?key,
                                ?timeout,
                                "correlation timed out"
                            );
                            ctx.fail(StepError::CorrelationTimeout {
                                step: self.name.clone(),
                                key: format!("{key:?}"),
                                timeout,
                            });
                            return Ok(());
                        }
                        Completion::Cancelled | Completion::Evicted => {
                            tracing::debug!(step = %self.name, minion = %ctx.minion_id, key = ?key, "correlation abandoned");
                            ctx.fail(StepError::Cancelled(self.name.clone()));
                            return Ok(());
                        }
                    }
                }
            };

            ctx.send((self.combiner)(left.value, values));
            Ok(())
        })
    }

    fn stop<'a>(&'a self, _ctx: &'a StepStartStopContext) -> StepFuture<'a> {
        Box::pin(async move {
            if !self.running.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            lock(&self.shutdown).cancel();
            let consumers = std::mem::take(&mut *lock(&self.consumers));
            for consumer in consumers {
                if let Err(e) = consumer.await {
                    tracing::warn!(step = %self.name, error = %e, "right consumer failed");
                }
            }
            for correlation in &self.right_correlations {
                correlation.topic.close();
            }
            tracing::debug!(step = %self.name, "inner join stopped");
            Ok(())
        })
    }

    fn destroy(&mut self) -> StepFuture<'_> {
        Box::pin(async move {
            self.cache.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use horde_api::TopicError;
    use topic_engine::{Topic, TopicConfig};

    use super::*;

    type Right = (u32, String);
    type JoinStep = InnerJoinStep<Option<u32>, u32, Right, String>;

    fn right_topic() -> Arc<dyn Topic<CorrelationRecord<Right>>> {
        TopicConfig::broadcast().with_buffer_size(1000).build()
    }

    fn join_step(topics: &[Arc<dyn Topic<CorrelationRecord<Right>>>], cache_timeout: Duration) -> JoinStep {
        let correlations = ["r1", "r2"]
            .into_iter()
            .zip(topics)
            .map(|(source, topic)| {
                // Key 0 stands for a right record without key.
                RightCorrelation::new(source, Arc::clone(topic), |record: &CorrelationRecord<Right>| {
                    Some(record.value.0).filter(|key| *key != 0)
                })
            })
            .collect();
        InnerJoinStep::new(
            "join",
            Handle::current(),
            |left: &CorrelationRecord<Option<u32>>| left.value,
            correlations,
            cache_timeout,
            |left: Option<u32>, values: CorrelatedValues<Right>| {
                format!("{}:{}:{}", left.unwrap_or_default(), values["r1"].1, values["r2"].1)
            },
        )
    }

    async fn started(cache_timeout: Duration) -> (JoinStep, Vec<Arc<dyn Topic<CorrelationRecord<Right>>>>) {
        let topics = vec![right_topic(), right_topic()];
        let step = join_step(&topics, cache_timeout);
        step.start(&StepStartStopContext::default()).await.unwrap();
        (step, topics)
    }

    async fn produce(topic: &Arc<dyn Topic<CorrelationRecord<Right>>>, source: &str, key: u32, text: &str) {
        topic
            .produce_value(CorrelationRecord::new("minion-0", source, (key, text.to_owned())))
            .await
            .unwrap();
    }

    fn context(minion: &str, key: Option<u32>) -> StepContext<Option<u32>, String> {
        StepContext::new(minion, "join", key).with_previous_step("left")
    }

    #[tokio::test]
    async fn execute_before_start_is_rejected() {
        let topics = vec![right_topic(), right_topic()];
        let step = join_step(&topics, Duration::from_secs(1));
        let mut ctx = context("minion-1", Some(123));

        let err = step.execute(&mut ctx).await.unwrap_err();

        assert!(matches!(err, StepError::NotInitialized(name) if name == "join"));
    }

    #[tokio::test]
    async fn joins_values_arriving_in_any_order() {
        let (step, topics) = started(Duration::from_secs(5)).await;
        produce(&topics[1], "r2", 123, "b").await;
        produce(&topics[0], "r1", 123, "a").await;

        let mut ctx = context("minion-1", Some(123));
        step.execute(&mut ctx).await.unwrap();

        assert_eq!(ctx.outputs(), ["123:a:b"]);
        assert!(!ctx.is_exhausted());
        assert!(!step.has_key_in_cache(&123));
    }

    #[tokio::test]
    async fn primary_waits_for_missing_values() {
        let (step, topics) = started(Duration::from_secs(5)).await;
        let mut ctx = context("minion-1", Some(123));

        let producer = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            produce(&topics[0], "r1", 123, "a").await;
            produce(&topics[1], "r2", 123, "b").await;
        };
        let (executed, _) = tokio::join!(step.execute(&mut ctx), producer);

        executed.unwrap();
        assert_eq!(ctx.outputs(), ["123:a:b"]);
        assert!(step.is_cache_empty());
    }

    #[tokio::test]
    async fn every_primary_on_a_key_emits_once() {
        let (step, topics) = started(Duration::from_secs(5)).await;
        let mut first = context("minion-1", Some(7));
        let mut second = context("minion-2", Some(7));

        let producer = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            produce(&topics[0], "r1", 7, "a").await;
            produce(&topics[1], "r2", 7, "b").await;
        };
        let (one, two, _) = tokio::join!(step.execute(&mut first), step.execute(&mut second), producer);

        one.unwrap();
        two.unwrap();
        assert_eq!(first.outputs(), ["7:a:b"]);
        assert_eq!(second.outputs(), ["7:a:b"]);
        assert!(!step.has_key_in_cache(&7));
    }

    #[tokio::test]
    async fn latest_duplicate_wins() {
        let (step, topics) = started(Duration::from_secs(5)).await;
        produce(&topics[0], "r1", 1, "old").await;
        produce(&topics[0], "r1", 1, "new").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        produce(&topics[1], "r2", 1, "b").await;

        let mut ctx = context("minion-1", Some(1));
        step.execute(&mut ctx).await.unwrap();

        assert_eq!(ctx.outputs(), ["1:new:b"]);
    }

    #[tokio::test]
    async fn missing_key_is_ignored() {
        let (step, _topics) = started(Duration::from_secs(5)).await;
        let mut ctx = context("minion-1", None);

        step.execute(&mut ctx).await.unwrap();

        assert!(ctx.outputs().is_empty());
        assert!(ctx.errors().is_empty());
        assert!(!ctx.is_exhausted());
        assert!(step.is_cache_empty());
    }

    #[tokio::test]
    async fn right_record_without_key_is_not_cached() {
        let (step, topics) = started(Duration::from_secs(5)).await;
        produce(&topics[0], "r1", 0, "a").await;
        produce(&topics[1], "r2", 0, "b").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(step.is_cache_empty());
        assert!(!step.has_key_in_cache(&0));
    }

    #[tokio::test]
    async fn abandoned_execution_without_cache_timeout_leaves_no_entry() {
        let (step, topics) = started(Duration::ZERO).await;
        produce(&topics[0], "r1", 5, "a").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(step.has_key_in_cache(&5));

        let mut ctx = context("minion-1", Some(5));
        let outcome = tokio::time::timeout(Duration::from_millis(50), step.execute(&mut ctx)).await;

        assert!(outcome.is_err());
        assert!(ctx.outputs().is_empty());
        assert!(step.is_cache_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_exhausts_context_and_discards_partial_values() {
        let (step, topics) = started(Duration::from_millis(100)).await;
        produce(&topics[0], "r1", 5, "a").await;

        let mut ctx = context("minion-1", Some(5));
        step.execute(&mut ctx).await.unwrap();

        assert!(ctx.is_exhausted());
        assert!(ctx.outputs().is_empty());
        assert!(matches!(
            ctx.errors(),
            [StepError::CorrelationTimeout { key, timeout, .. }]
                if key == "5" && *timeout == Duration::from_millis(100)
        ));
        assert!(!step.has_key_in_cache(&5));
    }

    #[tokio::test]
    async fn cancelled_minion_stops_waiting() {
        let (step, _topics) = started(Duration::ZERO).await;
        let token = CancellationToken::new();
        let mut ctx = context("minion-1", Some(9)).with_cancellation(token.clone());

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        };
        let (executed, _) = tokio::join!(step.execute(&mut ctx), canceller);

        executed.unwrap();
        assert!(ctx.is_exhausted());
        assert!(matches!(ctx.errors(), [StepError::Cancelled(_)]));
        assert!(step.is_cache_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_values_expire() {
        let (step, topics) = started(Duration::from_millis(100)).await;
        produce(&topics[0], "r1", 3, "a").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(step.has_key_in_cache(&3));

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!step.has_key_in_cache(&3));
    }

    #[tokio::test]
    async fn stop_closes_topics_and_rejects_execution() {
        let (mut step, topics) = started(Duration::from_secs(5)).await;
        produce(&topics[0], "r1", 1, "a").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        step.stop(&StepStartStopContext::default()).await.unwrap();

        assert!(!step.is_running());
        assert!(topics.iter().all(|topic| topic.is_closed()));
        assert_eq!(
            topics[0].produce_value(CorrelationRecord::new("m", "r1", (1, "x".into()))).await,
            Err(TopicError::Closed)
        );
        let mut ctx = context("minion-1", Some(1));
        assert!(matches!(
            step.execute(&mut ctx).await,
            Err(StepError::NotInitialized(_))
        ));

        assert!(step.has_key_in_cache(&1));
        step.destroy().await.unwrap();
        assert!(step.is_cache_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_producers_join_exactly_once() {
        let (step, topics) = started(Duration::from_secs(10)).await;
        let step = Arc::new(step);

        let producers: Vec<_> = (1..=100u32)
            .flat_map(|key| [(0, "r1", key), (1, "r2", key)])
            .map(|(index, source, key)| {
                let topic = Arc::clone(&topics[index]);
                tokio::spawn(async move {
                    topic
                        .produce_value(CorrelationRecord::new("minion-0", source, (key, format!("{source}-{key}"))))
                        .await
                })
            })
            .collect();
        let minions: Vec<_> = (1..=100u32)
            .map(|key| {
                let step = Arc::clone(&step);
                tokio::spawn(async move {
                    let mut ctx = context(&format!("minion-{key}"), Some(key));
                    step.execute(&mut ctx).await?;
                    Ok::<_, StepError>((key, ctx.take_outputs()))
                })
            })
            .collect();

        for producer in producers {
            producer.await.unwrap().unwrap();
        }
        for minion in minions {
            let (key, outputs) = tokio::time::timeout(Duration::from_secs(10), minion)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(outputs, [format!("{key}:r1-{key}:r2-{key}")]);
        }
        assert!(!step.has_key_in_cache(&123));
        assert!(step.is_cache_empty());
    }
}
