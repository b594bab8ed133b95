use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    transport::{Channel, Connection, QueueArgs, QueueOptions, Transport},
    QueueError, QueueResult,
};

/// A connection together with its control channel
pub(crate) struct Link {
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) channel: Arc<dyn Channel>,
}

impl Link {
    /// Declare a queue on a short-lived channel of its own.
    ///
    /// A rejected declaration closes the channel it ran on, so it must never
    /// run on the control channel.
    pub(crate) async fn declare(
        &self,
        name: &str,
        options: QueueOptions,
        args: &QueueArgs,
    ) -> QueueResult<()> {
        let channel = self
            .connection
            .open_channel()
            .await
            .map_err(|err| QueueError::transport("open_channel", err))?;

        let declared = channel.declare_queue(name, options, args).await;
        if let Err(err) = channel.close().await {
            debug!(queue = name, error = %err, "declaration channel already closed");
        }
        declared.map_err(|err| QueueError::declaration(name, err))
    }
}

/// Holds the broker's current [`Link`].
///
/// The supervisor is the only writer. Readers take a snapshot per operation
/// and never hold the lock across a transport round trip.
pub(crate) struct LinkCell {
    current: RwLock<Arc<Link>>,
}

impl LinkCell {
    pub(crate) fn new(link: Link) -> Self {
        Self {
            current: RwLock::new(Arc::new(link)),
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<Link> {
        self.current.read().clone()
    }

    /// Swap in a fresh link, returning the one it replaced
    fn replace(&self, link: Link) -> Arc<Link> {
        std::mem::replace(&mut *self.current.write(), Arc::new(link))
    }
}

/// Lifecycle of the connection supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Connected,
    Reconnecting,
    Stopped,
}

/// Dial `url` and open a control channel on the new connection
pub(crate) async fn establish(transport: &dyn Transport, url: &str) -> QueueResult<Link> {
    let connection = transport
        .dial(url)
        .await
        .map_err(|err| QueueError::Connection(format!("failed to connect: {}", err)))?;

    match connection.open_channel().await {
        Ok(channel) => Ok(Link {
            connection,
            channel,
        }),
        Err(err) => {
            let _ = connection.close().await;
            Err(QueueError::Connection(format!(
                "failed to open a channel: {}",
                err
            )))
        }
    }
}

/// Background task that replaces the broker's link whenever the transport
/// reports the connection as lost
pub(crate) struct Supervisor {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) url: String,
    pub(crate) backoff: Duration,
    pub(crate) cell: Arc<LinkCell>,
    pub(crate) state_tx: watch::Sender<SupervisorState>,
    pub(crate) reconnects: Arc<AtomicU64>,
}

/// Handle for stopping a running supervisor
pub(crate) struct SupervisorHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Stop the supervisor and wait for its loop to exit
    pub(crate) async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| QueueError::Internal(format!("connection supervisor join error: {}", e)))
    }
}

impl Supervisor {
    pub(crate) fn spawn(self) -> SupervisorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(self.run(shutdown_rx));

        SupervisorHandle {
            shutdown_tx,
            join_handle,
        }
    }

    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) {
        info!(url = %self.url, "connection supervisor started");

        loop {
            let closed = self.cell.snapshot().connection.closed();

            tokio::select! {
                _ = &mut shutdown_rx => break,
                cause = closed => {
                    error!(error = %cause, "transport connection lost");
                    self.state_tx.send_replace(SupervisorState::Reconnecting);

                    let link = tokio::select! {
                        _ = &mut shutdown_rx => break,
                        link = self.reconnect() => link,
                    };

                    self.cell.replace(link);
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.state_tx.send_replace(SupervisorState::Connected);
                    info!("transport connection re-established");
                }
            }
        }

        self.state_tx.send_replace(SupervisorState::Stopped);
        debug!("connection supervisor stopped");
    }

    /// Retry until both dial and channel-open succeed, with a fixed backoff
    async fn reconnect(&self) -> Link {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match establish(self.transport.as_ref(), &self.url).await {
                Ok(link) => return link,
                Err(err) => {
                    warn!(attempt, error = %err, "reconnect attempt failed");
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}
