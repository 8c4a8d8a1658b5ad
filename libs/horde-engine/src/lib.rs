//! Join steps merging the primary branch of a scenario with values
//! published by its secondary branches.

pub mod config;
pub mod correlation;
pub mod error;
pub mod inner_join;
pub mod right;
pub mod zip_last;

use std::sync::{Mutex, MutexGuard};

pub use config::{EngineConfig, JoinConfig};
pub use correlation::{CorrelatedValues, CorrelationCache};
pub use error::EngineError;
pub use inner_join::InnerJoinStep;
pub use right::{KeyExtractor, RightCorrelation, RightSource};
pub use zip_last::ZipLastStep;

/// Lock a mutex, recovering from poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("step mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
