use horde_api::{StepError, TopicError};
use horde_engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("step: {0}")]
    Step(#[from] StepError),

    #[error("topic: {0}")]
    Topic(#[from] TopicError),
}
