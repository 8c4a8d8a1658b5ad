use std::future::Future;
use std::pin::Pin;

use crate::context::{StepContext, StepStartStopContext};
use crate::error::StepError;

pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<(), StepError>> + Send + 'a>>;

/// Step of a scenario graph, driven by the orchestrator.
///
/// Lifecycle: `init()` once after construction, `start()` before the first
/// minion reaches the step, `execute()` once per minion, `stop()` when the
/// campaign ends for the scenario and `destroy()` before the step is dropped.
pub trait Step<I, O>: Send + Sync {
    fn name(&self) -> &str;

    fn init(&mut self) -> StepFuture<'_> {
        Box::pin(async { Ok(()) })
    }

    fn start<'a>(&'a self, _ctx: &'a StepStartStopContext) -> StepFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    /// Process the input of one minion. May suspend.
    fn execute<'a>(&'a self, ctx: &'a mut StepContext<I, O>) -> StepFuture<'a>;

    fn stop<'a>(&'a self, _ctx: &'a StepStartStopContext) -> StepFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn destroy(&mut self) -> StepFuture<'_> {
        Box::pin(async { Ok(()) })
    }
}
