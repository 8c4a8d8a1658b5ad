use tokio_util::sync::CancellationToken;

use crate::error::StepError;

/// Identifier of a minion (virtual user).
pub type MinionId = String;

/// Identifier of a step in a scenario graph.
pub type StepName = String;

/// Context passed to [`crate::Step::start`] and [`crate::Step::stop`].
#[derive(Debug, Clone, Default)]
pub struct StepStartStopContext {
    pub campaign: String,
    pub scenario: String,
    pub dag: String,
    pub step: StepName,
}

/// Per-minion execution context of one step.
///
/// Carries the input slot the step consumes, the outputs it emits and the
/// errors it reports. A step that cannot complete for the current minion
/// marks the context exhausted instead of failing the whole pipeline.
#[derive(Debug)]
pub struct StepContext<I, O> {
    pub minion_id: MinionId,
    pub step: StepName,
    pub previous_step: Option<StepName>,
    input: Option<I>,
    outputs: Vec<O>,
    errors: Vec<StepError>,
    exhausted: bool,
    token: CancellationToken,
}

impl<I, O> StepContext<I, O> {
    pub fn new(minion_id: impl Into<MinionId>, step: impl Into<StepName>, input: I) -> Self {
        Self {
            minion_id: minion_id.into(),
            step: step.into(),
            previous_step: None,
            input: Some(input),
            outputs: Vec::new(),
            errors: Vec::new(),
            exhausted: false,
            token: CancellationToken::new(),
        }
    }

    pub fn with_previous_step(mut self, previous: impl Into<StepName>) -> Self {
        self.previous_step = Some(previous.into());
        self
    }

    /// Bind the context to the minion's cancellation signal.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Take the input value. Can only succeed once.
    pub fn receive(&mut self) -> Result<I, StepError> {
        self.input
            .take()
            .ok_or_else(|| StepError::NoInput(self.step.clone()))
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    pub fn send(&mut self, output: O) {
        self.outputs.push(output);
    }

    pub fn outputs(&self) -> &[O] {
        &self.outputs
    }

    pub fn take_outputs(&mut self) -> Vec<O> {
        std::mem::take(&mut self.outputs)
    }

    pub fn add_error(&mut self, error: StepError) {
        self.errors.push(error);
    }

    pub fn errors(&self) -> &[StepError] {
        &self.errors
    }

    /// Record the error and stop the minion's execution of the scenario.
    pub fn fail(&mut self, error: StepError) {
        self.add_error(error);
        self.exhausted = true;
    }

    pub fn mark_exhausted(&mut self) {
        self.exhausted = true;
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }
}
