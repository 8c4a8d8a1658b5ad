use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use horde_api::{CorrelationRecord, Step, StepContext};
use horde_engine::{CorrelatedValues, InnerJoinStep, RightCorrelation};
use topic_engine::Topic;

use super::workload::{self, Outcome, Tally, minion_id, source_name};
use crate::config::Effective;
use crate::error::BenchError;

const STEP: &str = "inner-join";

type BenchTopic = Arc<dyn Topic<CorrelationRecord<u64>>>;

/// Every minion publishes its number on each source, then joins on it.
pub async fn run(eff: &Effective) -> Result<Tally, BenchError> {
    let topics: Vec<BenchTopic> = (0..eff.sources).map(|_| eff.topic.build()).collect();
    let correlations = topics
        .iter()
        .enumerate()
        .map(|(index, topic)| {
            RightCorrelation::new(source_name(index), Arc::clone(topic), |record: &CorrelationRecord<u64>| {
                Some(record.value)
            })
        })
        .collect();
    let step = Arc::new(InnerJoinStep::new(
        STEP,
        Handle::current(),
        |left: &CorrelationRecord<u64>| Some(left.value),
        correlations,
        eff.cache_timeout,
        |left: u64, values: CorrelatedValues<u64>| left + values.values().sum::<u64>(),
    ));

    let context = workload::start_stop_context("inner-join", STEP);
    step.start(&context).await?;
    tracing::info!(
        minions = eff.minions,
        sources = eff.sources,
        concurrency = eff.concurrency,
        mode = ?eff.topic.mode,
        cache_timeout = ?eff.cache_timeout,
        "inner join bench started"
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
            let mut ctx = StepContext::new(minion_id(minion), STEP, minion)
                .with_previous_step("left")
                .with_cancellation(cancel);
            step.execute(&mut ctx).await?;
            Ok::<_, BenchError>(Outcome::of(&ctx))
        });
    }

    let tally = workload::collect(&mut minions).await;
    workload::report("inner-join", &tally, started.elapsed());

    token.cancel();
    if let Err(e) = signal.await {
        tracing::warn!(error = %e, "signal listener failed");
    }
    step.stop(&context).await?;
    Ok(tally)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use topic_engine::TopicConfig;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_minion_joins() {
        let eff = Effective {
            minions: 200,
            sources: 3,
            concurrency: 16,
            topic: TopicConfig::broadcast().with_buffer_size(64),
            cache_timeout: Duration::from_secs(10),
        };

        let tally = run(&eff).await.unwrap();

        assert_eq!(tally.completed, 200);
        assert_eq!(tally.exhausted + tally.failed + tally.skipped, 0);
    }
}
