use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Unique identifier for a job
///
/// Also used as the name of the transient queue backing a delayed publish,
/// so generated ids only contain characters valid in a queue name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new unique job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Generator for consumer registration names
///
/// Each broker owns one generator; every consumer it registers is named
/// `{prefix}-{queue}-{seq}` with a strictly increasing sequence number.
#[derive(Debug)]
pub struct ConsumerTags {
    prefix: String,
    seq: AtomicU64,
}

impl ConsumerTags {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            seq: AtomicU64::new(0),
        }
    }

    /// Produce the next consumer tag for `queue`
    pub fn next_for(&self, queue: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}-{}", self.prefix, queue, seq)
    }
}
