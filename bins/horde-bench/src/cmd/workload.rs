use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use horde_api::{MinionId, StepContext, StepName, StepStartStopContext};

use crate::error::BenchError;

/// Result of one minion execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The step emitted its output.
    Completed,
    /// The step gave up on the minion (timeout or cancellation).
    Exhausted,
    /// The step had nothing to emit.
    Skipped,
}

impl Outcome {
    pub fn of<I, O>(ctx: &StepContext<I, O>) -> Self {
        if ctx.is_exhausted() {
            Outcome::Exhausted
        } else if ctx.outputs().is_empty() {
            Outcome::Skipped
        } else {
            Outcome::Completed
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub completed: usize,
    pub exhausted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Tally {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Exhausted => self.exhausted += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

pub fn minion_id(minion: u64) -> MinionId {
    format!("minion-{minion}")
}

pub fn source_name(index: usize) -> StepName {
    format!("right-{index}")
}

pub fn start_stop_context(scenario: &str, step: &str) -> StepStartStopContext {
    StepStartStopContext {
        campaign: "horde-bench".into(),
        scenario: scenario.into(),
        dag: "main".into(),
        step: step.into(),
    }
}

/// Cancel `token` on Ctrl-C. The task ends once `token` is cancelled.
pub fn cancel_on_ctrl_c(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    tracing::info!("interrupted, cancelling outstanding minions");
                    token.cancel();
                }
                Err(e) => tracing::warn!(error = %e, "cannot listen for ctrl-c"),
            },
        }
    })
}

/// Wait for every minion and count their outcomes.
///
/// A step error scoped to its minion exhausts that minion only; any other
/// error counts as a failure.
pub async fn collect(minions: &mut JoinSet<Result<Outcome, BenchError>>) -> Tally {
    let mut tally = Tally::default();
    while let Some(joined) = minions.join_next().await {
        match joined {
            Ok(Ok(outcome)) => tally.record(outcome),
            Ok(Err(BenchError::Step(e))) if e.is_local() => {
                tracing::debug!(error = %e, "minion exhausted");
                tally.record(Outcome::Exhausted);
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "minion failed");
                tally.failed += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "minion task aborted");
                tally.failed += 1;
            }
        }
    }
    tally
}

pub fn report(bench: &str, tally: &Tally, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let throughput = if secs > 0.0 {
        tally.completed as f64 / secs
    } else {
        0.0
    };
    tracing::info!(
        bench,
        completed = tally.completed,
        exhausted = tally.exhausted,
        skipped = tally.skipped,
        failed = tally.failed,
        elapsed_ms = elapsed.as_millis() as u64,
        minions_per_sec = throughput,
        "bench finished"
    );
}
