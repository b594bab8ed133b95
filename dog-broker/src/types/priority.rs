use serde::{Deserialize, Serialize};

/// Job priority passed through to the backend untouched
///
/// Interpretation is left to the backend; the in-memory backend ignores it
/// and delivers in FIFO order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(4);
    pub const URGENT: Priority = Priority(8);

    /// Get the numeric value sent on the wire
    pub fn as_u8(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::LOW),
            "normal" => Ok(Self::NORMAL),
            "urgent" => Ok(Self::URGENT),
            other => other
                .parse::<u8>()
                .map(Self)
                .map_err(|_| format!("Invalid priority: {}", s)),
        }
    }
}
