use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use horde_api::{CorrelationRecord, Step, StepContext, StepError, StepFuture, StepName, StepStartStopContext};
use topic_engine::Subscription;

use crate::lock;
use crate::right::RightSource;

/// Step pairing the primary value of each minion with the latest value of
/// every secondary source, in the order of the sources.
///
/// The latest values are shared by all the minions running the step. An
/// execution only waits for a source that never delivered anything yet.
pub struct ZipLastStep<I, R> {
    name: StepName,
    runtime: Handle,
    right_sources: Vec<RightSource<R>>,
    slots: Arc<Vec<watch::Sender<Option<R>>>>,
    running: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    _input: PhantomData<fn(I)>,
}

impl<I, R> std::fmt::Debug for ZipLastStep<I, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipLastStep")
            .field("name", &self.name)
            .field("right_sources", &self.right_sources)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<I, R> ZipLastStep<I, R>
where
    I: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<StepName>, runtime: Handle, right_sources: Vec<RightSource<R>>) -> Self {
        let slots = right_sources.iter().map(|_| watch::channel(None).0).collect();
        Self {
            name: name.into(),
            runtime,
            right_sources,
            slots: Arc::new(slots),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            consumers: Mutex::new(Vec::new()),
            _input: PhantomData,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Latest value received from the source at `index`.
    pub fn last_value(&self, index: usize) -> Option<R> {
        self.slots.get(index).and_then(|slot| slot.borrow().clone())
    }

    fn spawn_consumer(
        &self,
        index: usize,
        subscription: Arc<Subscription<CorrelationRecord<R>>>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let slots = Arc::clone(&self.slots);
        let step = self.name.clone();
        let source = self.right_sources[index].source.clone();
        self.runtime.spawn(async move {
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
                tracing::trace!(step = %step, source = %source, minion = %record.minion_id, "latest right value updated");
                slots[index].send_replace(Some(record.value));
            }
            tracing::debug!(step = %step, source = %source, "right consumer stopped");
        })
    }
}

/// First value of the slot, waiting for one if it was never set.
async fn latest<R: Clone>(slot: &mut watch::Receiver<Option<R>>) -> Option<R> {
    loop {
        let current = slot.borrow_and_update().clone();
        if current.is_some() {
            return current;
        }
        if slot.changed().await.is_err() {
            return None;
        }
    }
}

impl<I, R> Step<I, (I, Vec<R>)> for ZipLastStep<I, R>
where
    I: Send + 'static,
    R: Clone + Send + Sync + 'static,
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
            let mut consumers = Vec::with_capacity(self.right_sources.len());
            for (index, right) in self.right_sources.iter().enumerate() {
                let subscription = match right.topic.subscribe(&self.name).await {
                    Ok(subscription) => subscription,
                    Err(e) => {
                        token.cancel();
                        return Err(e.into());
                    }
                };
                consumers.push(self.spawn_consumer(index, subscription, token.clone()));
            }

            *lock(&self.shutdown) = token;
            lock(&self.consumers).extend(consumers);
            self.running.store(true, Ordering::Release);
            tracing::debug!(step = %self.name, sources = self.right_sources.len(), "zip last started");
            Ok(())
        })
    }

    fn execute<'a>(&'a self, ctx: &'a mut StepContext<I, (I, Vec<R>)>) -> StepFuture<'a> {
        Box::pin(async move {
            if !self.is_running() {
                return Err(StepError::NotInitialized(self.name.clone()));
            }
            let input = ctx.receive()?;
            let token = ctx.cancellation().clone();

            let mut values = Vec::with_capacity(self.slots.len());
            for slot in self.slots.iter() {
                let mut receiver = slot.subscribe();
                let value = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    value = latest(&mut receiver) => value,
                };
                match value {
                    Some(value) => values.push(value),
                    None => {
                        tracing::debug!(step = %self.name, minion = %ctx.minion_id, "zip abandoned");
                        ctx.fail(StepError::Cancelled(self.name.clone()));
                        return Ok(());
                    }
                }
            }

            ctx.send((input, values));
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
            for right in &self.right_sources {
                right.topic.close();
            }
            tracing::debug!(step = %self.name, "zip last stopped");
            Ok(())
        })
    }

    fn destroy(&mut self) -> StepFuture<'_> {
        Box::pin(async move {
            for slot in self.slots.iter() {
                slot.send_replace(None);
            }
            Ok(())
        })
    }
}
