use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use super::queue::AmqpQueue;
use super::supervisor::{establish, Link, LinkCell, Supervisor, SupervisorHandle, SupervisorState};
use crate::{
    backend::{Broker, Queue},
    config::BrokerConfig,
    transport::{QueueArgs, QueueOptions, Transport},
    ConsumerTags, QueueError, QueueResult,
};

/// State shared by a broker and every queue derived from it
pub(crate) struct BrokerShared {
    cell: Arc<LinkCell>,
    closed: AtomicBool,
    pub(crate) tags: ConsumerTags,
}

impl BrokerShared {
    /// Snapshot of the current link, or `Closed` once the broker is closed
    pub(crate) fn link(&self) -> QueueResult<Arc<Link>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        Ok(self.cell.snapshot())
    }
}

/// Broker backed by a transport connection that survives network failures.
///
/// A background supervisor watches the connection and, when it drops,
/// re-dials every `reconnect_backoff` until a new connection and control
/// channel are up, then swaps them in. Queues obtained earlier keep working
/// because they always read the link through the broker.
pub struct AmqpBroker {
    shared: Arc<BrokerShared>,
    supervisor: Mutex<Option<SupervisorHandle>>,
    state_rx: watch::Receiver<SupervisorState>,
    reconnects: Arc<AtomicU64>,
}

impl AmqpBroker {
    /// Connect to an AMQP server using the `lapin` client
    #[cfg(feature = "amqp")]
    pub async fn connect(config: &BrokerConfig) -> QueueResult<Self> {
        Self::with_transport(Arc::new(crate::transport::amqp::LapinTransport::new()), config).await
    }

    /// Connect through an arbitrary transport client
    #[instrument(skip(transport, config), fields(url = %config.url))]
    pub async fn with_transport(
        transport: Arc<dyn Transport>,
        config: &BrokerConfig,
    ) -> QueueResult<Self> {
        let link = establish(transport.as_ref(), &config.url).await?;
        let cell = Arc::new(LinkCell::new(link));
        let (state_tx, state_rx) = watch::channel(SupervisorState::Connected);
        let reconnects = Arc::new(AtomicU64::new(0));

        let supervisor = Supervisor {
            transport,
            url: config.url.clone(),
            backoff: config.reconnect_backoff,
            cell: cell.clone(),
            state_tx,
            reconnects: reconnects.clone(),
        }
        .spawn();

        info!("broker connected");

        Ok(Self {
            shared: Arc::new(BrokerShared {
                cell,
                closed: AtomicBool::new(false),
                tags: ConsumerTags::new(config.consumer_prefix.clone()),
            }),
            supervisor: Mutex::new(Some(supervisor)),
            state_rx,
            reconnects,
        })
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every supervisor state transition
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_rx.clone()
    }

    /// Number of completed reconnections since the broker was created
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    #[instrument(skip(self))]
    async fn queue(&self, name: &str) -> QueueResult<Arc<dyn Queue>> {
        let link = self.shared.link()?;
        link.declare(name, QueueOptions::durable(), &QueueArgs::default()).await?;

        Ok(Arc::new(AmqpQueue::new(name, self.shared.clone())))
    }

    async fn close(&self) -> QueueResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(QueueError::Closed);
        }

        let supervisor = self.supervisor.lock().take();
        let stopped = match supervisor {
            Some(supervisor) => supervisor.shutdown().await,
            None => Ok(()),
        };

        // The link may already be dead if the supervisor was mid-reconnect;
        // the broker is shut down either way
        let link = self.shared.cell.snapshot();
        if let Err(err) = link.channel.close().await {
            warn!(error = %err, "control channel did not close cleanly");
        }
        if let Err(err) = link.connection.close().await {
            warn!(error = %err, "connection did not close cleanly");
        }

        info!("broker closed");
        stopped
    }
}
