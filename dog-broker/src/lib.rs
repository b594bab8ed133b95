//! # dog-broker: Broker-Agnostic Job Queues
//!
//! Producers publish immediate, delayed or transactional jobs; consumers
//! pull one job at a time and ack, reject, or requeue it. Application code
//! talks to four small capabilities (`Broker`, `Queue`, `JobIterator`,
//! `Acknowledger`) and never to a specific transport.
//!
//! ## Backends
//!
//! - **AMQP** (`amqp://`, `amqps://`): durable queues on an AMQP 0-9-1 server.
//!   A background supervisor re-establishes the connection after network
//!   failures. Delays use a transient per-job queue whose TTL dead-letters
//!   into the destination, so no server plugin is required.
//! - **Memory** (`memory://`): in-process reference backend for tests.
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_broker::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct ResizeImage {
//!     blob_id: String,
//!     width: u32,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> QueueResult<()> {
//! let broker = dog_broker::connect(&BrokerConfig::new("memory://")).await?;
//! let queue = broker.queue("images").await?;
//!
//! let job = Job::encode(&ResizeImage { blob_id: "b-1".into(), width: 640 })?
//!     .with_priority(Priority::URGENT);
//! queue.publish(&job).await?;
//!
//! let jobs = queue.consume().await?;
//! let received = jobs.next().await?;
//! let task: ResizeImage = received.decode()?;
//! assert_eq!(task.width, 640);
//! received.ack().await?;
//!
//! jobs.close().await?;
//! broker.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod observability;
pub mod transport;
pub mod types;

use std::sync::Arc;
use tracing::info;

pub use backend::{tx, Acknowledger, Broker, JobIterator, Queue, TxCallback};
pub use backend::amqp::{AmqpBroker, SupervisorState};
pub use backend::memory::MemoryBroker;
pub use config::BrokerConfig;
pub use error::{QueueError, QueueResult};
pub use types::{ConsumerTags, ContentType, Job, JobId, Priority};

/// Open a broker for `config.url`, choosing the backend from the URL scheme
pub async fn connect(config: &BrokerConfig) -> QueueResult<Arc<dyn Broker>> {
    let scheme = config.scheme()?;
    let broker: Arc<dyn Broker> = match scheme.as_str() {
        #[cfg(feature = "amqp")]
        "amqp" | "amqps" => Arc::new(AmqpBroker::connect(config).await?),
        "memory" => Arc::new(MemoryBroker::new()),
        _ => return Err(QueueError::UnsupportedScheme(scheme)),
    };

    info!(scheme = %scheme, "broker ready");
    Ok(broker)
}

/// Everything needed to publish and consume jobs
pub mod prelude {
    pub use crate::{
        connect, tx, Acknowledger, Broker, BrokerConfig, ContentType, Job, JobId, JobIterator,
        Priority, Queue, QueueError, QueueResult,
    };

    pub use async_trait::async_trait;
}
