pub mod context;
pub mod duration;
pub mod error;
pub mod record;
pub mod step;

pub use context::{MinionId, StepContext, StepName, StepStartStopContext};
pub use error::{StepError, TopicError};
pub use record::{CorrelationRecord, Headers, Record};
pub use step::{Step, StepFuture};
