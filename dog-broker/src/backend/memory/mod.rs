pub mod broker;
pub(crate) mod storage;

pub use broker::{MemoryBroker, MemoryJobIterator, MemoryQueue};
