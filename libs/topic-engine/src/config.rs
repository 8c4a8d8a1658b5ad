use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use horde_api::duration::opt_millis;

use crate::{BroadcastTopic, LoopTopic, Topic, UnicastTopic};

/// Replay capacity of a broadcast topic read from the beginning, when no
/// buffer size is configured.
pub const DEFAULT_REPLAY_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicMode {
    /// Every subscriber receives every record.
    #[default]
    Broadcast,
    /// Each record goes to a single subscriber.
    Unicast,
    /// Records are kept and replayed in a loop once the topic is completed.
    Loop,
}

/// How to build a topic for one edge of a scenario graph.
///
/// ```toml
/// mode = "broadcast"
/// buffer_size = 100
/// from_beginning = true
/// subscription_idle_timeout_ms = 30000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub mode: TopicMode,
    /// Bounded buffer size, `None` for unlimited. For a broadcast topic read
    /// from the beginning, also the number of replayed records.
    pub buffer_size: Option<usize>,
    /// Broadcast: replay the latest records to new subscribers.
    /// Unicast: keep records produced before the first subscription.
    pub from_beginning: bool,
    /// Cancel subscriptions that are not polled for that long.
    #[serde(rename = "subscription_idle_timeout_ms", with = "opt_millis")]
    pub subscription_idle_timeout: Option<Duration>,
}

impl TopicConfig {
    pub fn broadcast() -> Self {
        Self::default()
    }

    pub fn unicast() -> Self {
        Self {
            mode: TopicMode::Unicast,
            ..Self::default()
        }
    }

    pub fn looping() -> Self {
        Self {
            mode: TopicMode::Loop,
            ..Self::default()
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    pub fn from_beginning(mut self) -> Self {
        self.from_beginning = true;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.subscription_idle_timeout = Some(idle_timeout);
        self
    }

    /// Create a topic carrying values of type `T`.
    pub fn build<T: Clone + Send + Sync + 'static>(&self) -> Arc<dyn Topic<T>> {
        let idle = self.subscription_idle_timeout;
        match self.mode {
            TopicMode::Broadcast => {
                let replay = if self.from_beginning {
                    self.buffer_size.unwrap_or(DEFAULT_REPLAY_BUFFER)
                } else {
                    0
                };
                Arc::new(BroadcastTopic::new(self.buffer_size, replay, idle))
            }
            TopicMode::Unicast => Arc::new(UnicastTopic::new(self.buffer_size, self.from_beginning, idle)),
            TopicMode::Loop => Arc::new(LoopTopic::new(idle)),
        }
    }
}
