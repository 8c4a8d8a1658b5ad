use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::context::{MinionId, StepName};

/// Free-form metadata attached to a [`Record`].
pub type Headers = HashMap<String, serde_json::Value>;

/// Envelope distributed by a topic: a value plus its headers.
///
/// The payload type is fixed when the topic is created, so consumers never
/// have to cast what they poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    #[serde(default)]
    pub headers: Headers,
    pub value: T,
}

impl<T> Record<T> {
    pub fn new(value: T) -> Self {
        Self {
            headers: Headers::new(),
            value,
        }
    }

    pub fn with_headers(value: T, headers: Headers) -> Self {
        Self { headers, value }
    }

    /// Add a header, replacing any previous value under the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&serde_json::Value> {
        self.headers.get(name)
    }

    pub fn into_value(self) -> T {
        self.value
    }

    /// Transform the value, keeping the headers.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Record<U> {
        Record {
            headers: self.headers,
            value: f(self.value),
        }
    }
}

/// Value emitted on a secondary branch of a scenario, tagged with the minion
/// and the step that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRecord<T> {
    pub minion_id: MinionId,
    pub source: StepName,
    pub value: T,
}

impl<T> CorrelationRecord<T> {
    pub fn new(minion_id: impl Into<MinionId>, source: impl Into<StepName>, value: T) -> Self {
        Self {
            minion_id: minion_id.into(),
            source: source.into(),
            value,
        }
    }
}
