use std::time::Duration;

use crate::context::StepName;

/// Failures of topic operations. Always reported to the caller of the
/// operation that triggered them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic is closed")]
    Closed,

    #[error("no subscription for '{0}'")]
    UnknownSubscription(String),

    #[error("subscription '{0}' is cancelled")]
    CancelledSubscription(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error("step '{0}' is not started")]
    NotInitialized(StepName),

    #[error("step '{step}': no correlated values for key {key} within {timeout:?}")]
    CorrelationTimeout {
        step: StepName,
        key: String,
        timeout: Duration,
    },

    #[error("step '{0}': execution cancelled")]
    Cancelled(StepName),

    #[error("step '{0}': no input to consume")]
    NoInput(StepName),

    #[error("topic: {0}")]
    Topic(#[from] TopicError),
}

impl StepError {
    /// Whether the error only concerns the current minion execution, as
    /// opposed to a misuse of the step itself.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            StepError::CorrelationTimeout { .. } | StepError::Cancelled(_) | StepError::NoInput(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_minion_scoped_errors_are_local() {
        let timeout = StepError::CorrelationTimeout {
            step: "join".into(),
            key: "7".into(),
            timeout: Duration::from_millis(100),
        };
        assert!(timeout.is_local());
        assert!(StepError::Cancelled("join".into()).is_local());
        assert!(StepError::NoInput("join".into()).is_local());

        assert!(!StepError::NotInitialized("join".into()).is_local());
        assert!(!StepError::from(TopicError::Closed).is_local());
    }
}
