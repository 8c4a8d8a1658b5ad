use horde_api::StepError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("step error: {0}")]
    Step(#[from] StepError),
}

impl EngineError {
    /// Prepend context to the message of a `Config` error.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}
