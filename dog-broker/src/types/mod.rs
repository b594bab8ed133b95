pub mod ids;
pub mod job;
pub mod priority;

pub use ids::{ConsumerTags, JobId};
pub use job::{ContentType, Job};
pub use priority::Priority;
