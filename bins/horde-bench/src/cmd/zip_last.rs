use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use horde_api::{CorrelationRecord, Step, StepContext};
use horde_engine::{RightSource, ZipLastStep};
use topic_engine::Topic;

use super::workload::{self, Outcome, Tally, minion_id, source_name};
use crate::config::Effective;
use crate::error::BenchError;

const STEP: &str = "zip-last";

type BenchTopic = Arc<dyn Topic<CorrelationRecord<u64>>>;

/// Every minion publishes its number on each source, then zips with
/// whatever the sources hold last.
pub async fn run(eff: &Effective) -> Result<Tally, BenchError> {
    let topics: Vec<BenchTopic> = (0..eff.sources).map(|_| eff.topic.build()).collect();
    let sources = topics
        .iter()
        .enumerate()
        .map(|(index, topic)| RightSource::new(source_name(index), Arc::clone(topic)))
        .collect();
    let step = Arc::new(ZipLastStep::<u64, u64>::new(STEP, Handle::current(), sources));

    let context = workload::start_stop_context("zip-last", STEP);
    step.start(&context).await?;
    tracing::info!(
        minions = eff.minions,
        sources = eff.sources,
        concurrency = eff.concurrency,
        mode = ?eff.topic.mode,
        "zip last bench started"
    );

    let token = CancellationToken::new();
    let signal = workload::cancel_on_ctrl_c(token.clone());
    let limit = Arc::new(Semaphore::new(eff.concurrency));
    let started = Instant::now();

    let mut minions: JoinSet<Result<Outcome, BenchError>> = JoinSet::new();
    for minion in 0..eff.minions as u64 {
        if token.is_cancelled() {
            break;
        }
        let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
            break;
        };
        let step = Arc::clone(&step);
        let topics = topics.clone();
        let cancel = token.child_token();
        minions.spawn(async move {
            let _permit = permit;
            for (index, topic) in topics.iter().enumerate() {
                topic
                    .produce_value(CorrelationRecord::new(minion_id(minion), source_name(index), minion))
                    .await?;
            }
            let mut ctx = StepContext::new(minion_id(minion), STEP, minion).with_cancellation(cancel);
            step.execute(&mut ctx).await?;
            if let Some((left, latest)) = ctx.outputs().first() {
                tracing::trace!(left, ?latest, "zipped");
            }
            Ok::<_, BenchError>(Outcome::of(&ctx))
        });
    }

    let tally = workload::collect(&mut minions).await;
    workload::report("zip-last", &tally, started.elapsed());

    token.cancel();
    if let Err(e) = signal.await {
        tracing::warn!(error = %e, "signal listener failed");
    }
    step.stop(&context).await?;
    Ok(tally)
}
