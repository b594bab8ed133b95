//! Scripted in-process transport for exercising the transport-backed broker
//! without a running server.
//!
//! `FakeServer` keeps durable queue contents across connections, applies
//! TTL dead-lettering for holding queues, buffers transactional publishes per
//! channel and lets tests sever connections or fail dials and rollbacks.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

use dog_broker::transport::{
    Channel, Connection, Delivery, DeliveryStream, Envelope, QueueArgs, QueueOptions, Transport,
    TransportError, TransportResult,
};

/// A queue declaration observed by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub name: String,
    pub options: QueueOptions,
    pub args: QueueArgs,
}

#[derive(Default)]
struct ServerState {
    queues: HashMap<String, VecDeque<Envelope>>,
    args: HashMap<String, QueueArgs>,
    declared: HashMap<String, (QueueOptions, QueueArgs)>,
    declarations: Vec<Declaration>,
    consumers: Vec<String>,
    cancelled: Vec<String>,
    acked: Vec<String>,
    connections: Vec<Arc<ConnectionState>>,
}

#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
    changed: Notify,
    dials: AtomicUsize,
    failing_dials: AtomicUsize,
    fail_rollback: AtomicBool,
    fail_commit: AtomicBool,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport(self: &Arc<Self>) -> Arc<FakeTransport> {
        Arc::new(FakeTransport {
            server: self.clone(),
        })
    }

    /// Drop every live connection as a network failure would
    pub fn sever(&self) {
        let connections = std::mem::take(&mut self.state.lock().connections);
        for connection in connections {
            connection.fail(TransportError::new("connection reset by peer"));
        }
        self.changed.notify_waiters();
    }

    /// Make the next `count` dials fail
    pub fn fail_dials(&self, count: usize) {
        self.failing_dials.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_rollback(&self) {
        self.fail_rollback.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn channels_open(&self) -> usize {
        self.channels_opened.load(Ordering::SeqCst) - self.channels_closed.load(Ordering::SeqCst)
    }

    /// Messages currently stored in `queue`, excluding unacknowledged deliveries
    pub fn depth(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn declarations(&self) -> Vec<Declaration> {
        self.state.lock().declarations.clone()
    }

    pub fn declaration(&self, name: &str) -> Option<Declaration> {
        self.declarations().into_iter().find(|d| d.name == name)
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        self.state.lock().consumers.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }

    /// Message ids acknowledged by consumers, in order
    pub fn acked(&self) -> Vec<String> {
        self.state.lock().acked.clone()
    }

    /// Create a queue as if another application had declared it earlier
    pub fn existing_queue(&self, name: &str, options: QueueOptions, args: &QueueArgs) {
        self.declare(name, options, args)
            .expect("existing queue conflicts with an earlier declaration");
    }

    /// Redeclaring a queue with different properties is refused, like a
    /// server answering 406 PRECONDITION_FAILED
    fn declare(&self, name: &str, options: QueueOptions, args: &QueueArgs) -> TransportResult<()> {
        let mut state = self.state.lock();
        if let Some((existing_options, existing_args)) = state.declared.get(name) {
            if *existing_options != options || existing_args != args {
                return Err(TransportError::new(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                    name
                )));
            }
        }
        state
            .declared
            .insert(name.to_string(), (options, args.clone()));
        state.queues.entry(name.to_string()).or_default();
        if !args.is_empty() {
            state.args.insert(name.to_string(), args.clone());
        }
        state.declarations.push(Declaration {
            name: name.to_string(),
            options,
            args: args.clone(),
        });
        Ok(())
    }

    fn route(self: &Arc<Self>, routing_key: &str, envelope: Envelope) -> TransportResult<()> {
        let args = {
            let mut state = self.state.lock();
            let Some(queue) = state.queues.get_mut(routing_key) else {
                return Err(TransportError::new(format!("no queue '{}'", routing_key)));
            };
            queue.push_back(envelope.clone());
            state.args.get(routing_key).cloned()
        };
        self.changed.notify_waiters();

        if let (Some(ttl), Some(target)) = args
            .as_ref()
            .map(|a| (a.message_ttl_ms, a.dead_letter_routing_key.clone()))
            .unwrap_or((None, None))
        {
            let server = self.clone();
            let holding = routing_key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ttl.max(0) as u64)).await;
                server.dead_letter(&holding, &target, &envelope.message_id);
            });
        }
        Ok(())
    }

    fn dead_letter(&self, holding: &str, target: &str, message_id: &str) {
        {
            let mut state = self.state.lock();
            let moved = state.queues.get_mut(holding).and_then(|queue| {
                let index = queue.iter().position(|e| e.message_id == message_id)?;
                queue.remove(index)
            });
            if let (Some(envelope), Some(queue)) = (moved, state.queues.get_mut(target)) {
                queue.push_back(envelope);
            }
        }
        self.changed.notify_waiters();
    }

    fn requeue(&self, queue: &str, envelope: Envelope) {
        if let Some(queue) = self.state.lock().queues.get_mut(queue) {
            queue.push_front(envelope);
        }
        self.changed.notify_waiters();
    }

    fn pop(&self, queue: &str) -> Option<Envelope> {
        self.state.lock().queues.get_mut(queue)?.pop_front()
    }
}

pub struct FakeTransport {
    server: Arc<FakeServer>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn dial(&self, url: &str) -> TransportResult<Arc<dyn Connection>> {
        self.server.dials.fetch_add(1, Ordering::SeqCst);
        let failing = self.server.failing_dials.load(Ordering::SeqCst);
        if failing > 0 {
            self.server.failing_dials.store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::new(format!("connection refused: {}", url)));
        }

        let (closed_tx, closed_rx) = oneshot::channel();
        let state = Arc::new(ConnectionState {
            alive: AtomicBool::new(true),
            closed_tx: Mutex::new(Some(closed_tx)),
        });
        self.server.state.lock().connections.push(state.clone());

        Ok(Arc::new(FakeConnection {
            server: self.server.clone(),
            state,
            closed_rx: Mutex::new(Some(closed_rx)),
        }))
    }
}

struct ConnectionState {
    alive: AtomicBool,
    closed_tx: Mutex<Option<oneshot::Sender<TransportError>>>,
}

impl ConnectionState {
    fn fail(&self, cause: TransportError) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(tx) = self.closed_tx.lock().take() {
            let _ = tx.send(cause);
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

pub struct FakeConnection {
    server: Arc<FakeServer>,
    state: Arc<ConnectionState>,
    closed_rx: Mutex<Option<oneshot::Receiver<TransportError>>>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn open_channel(&self) -> TransportResult<Arc<dyn Channel>> {
        if !self.state.is_alive() {
            return Err(TransportError::new("connection is closed"));
        }
        self.server.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeChannel {
            server: self.server.clone(),
            connection: self.state.clone(),
            open: Arc::new(AtomicBool::new(true)),
            transactional: AtomicBool::new(false),
            cancelled: Arc::new(AtomicBool::new(false)),
            pending: Mutex::new(Vec::new()),
            unacked: Arc::new(Mutex::new(HashMap::new())),
            next_tag: Arc::new(AtomicU64::new(0)),
        }))
    }

    fn closed(&self) -> BoxFuture<'static, TransportError> {
        match self.closed_rx.lock().take() {
            Some(rx) => async move {
                match rx.await {
                    Ok(cause) => cause,
                    Err(_) => future::pending().await,
                }
            }
            .boxed(),
            None => future::pending().boxed(),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.state.alive.swap(false, Ordering::SeqCst) {
            return Err(TransportError::new("invalid connection state: closed"));
        }
        // Graceful close never fires the failure notification
        self.state.closed_tx.lock().take();
        self.server.changed.notify_waiters();
        Ok(())
    }
}

type Unacked = Arc<Mutex<HashMap<u64, (String, Envelope)>>>;

pub struct FakeChannel {
    server: Arc<FakeServer>,
    connection: Arc<ConnectionState>,
    open: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    transactional: AtomicBool,
    pending: Mutex<Vec<(String, Envelope)>>,
    unacked: Unacked,
    next_tag: Arc<AtomicU64>,
}

impl FakeChannel {
    fn ensure_usable(&self) -> TransportResult<()> {
        if !self.connection.is_alive() {
            return Err(TransportError::new("connection is closed"));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::new("channel is closed"));
        }
        Ok(())
    }
}

struct ConsumerLoop {
    server: Arc<FakeServer>,
    connection: Arc<ConnectionState>,
    open: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    queue: String,
    next_tag: Arc<AtomicU64>,
    unacked: Unacked,
}

#[async_trait]
impl Channel for FakeChannel {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        args: &QueueArgs,
    ) -> TransportResult<()> {
        self.ensure_usable()?;
        let declared = self.server.declare(name, options, args);
        if declared.is_err() {
            // Channel-level errors close the channel
            self.shut();
        }
        declared
    }

    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> TransportResult<()> {
        self.ensure_usable()?;
        if self.transactional.load(Ordering::SeqCst) {
            self.pending
                .lock()
                .push((routing_key.to_string(), envelope.clone()));
            return Ok(());
        }
        self.server.route(routing_key, envelope.clone())
    }

    async fn set_qos(&self, _prefetch_count: u16) -> TransportResult<()> {
        self.ensure_usable()
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> TransportResult<DeliveryStream> {
        self.ensure_usable()?;
        {
            let mut state = self.server.state.lock();
            if !state.queues.contains_key(queue) {
                return Err(TransportError::new(format!("no queue '{}'", queue)));
            }
            state.consumers.push(consumer_tag.to_string());
        }

        let looped = ConsumerLoop {
            server: self.server.clone(),
            connection: self.connection.clone(),
            open: self.open.clone(),
            cancelled: self.cancelled.clone(),
            queue: queue.to_string(),
            next_tag: self.next_tag.clone(),
            unacked: self.unacked.clone(),
        };

        let stream = futures::stream::unfold(looped, |looped| async move {
            loop {
                let server = looped.server.clone();
                let notified = server.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if !looped.connection.is_alive() {
                    return Some((Err(TransportError::new("connection is closed")), looped));
                }
                if !looped.open.load(Ordering::SeqCst) || looped.cancelled.load(Ordering::SeqCst) {
                    return None;
                }
                if let Some(envelope) = looped.server.pop(&looped.queue) {
                    let tag = looped.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                    looped
                        .unacked
                        .lock()
                        .insert(tag, (looped.queue.clone(), envelope.clone()));
                    return Some((Ok(Delivery { tag, envelope }), looped));
                }

                notified.await;
            }
        });
        Ok(Box::pin(stream))
    }

    async fn cancel(&self, consumer_tag: &str) -> TransportResult<()> {
        self.ensure_usable()?;
        self.server
            .state
            .lock()
            .cancelled
            .push(consumer_tag.to_string());
        self.cancelled.store(true, Ordering::SeqCst);
        self.server.changed.notify_waiters();
        Ok(())
    }

    async fn tx_select(&self) -> TransportResult<()> {
        self.ensure_usable()?;
        self.transactional.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn tx_commit(&self) -> TransportResult<()> {
        self.ensure_usable()?;
        if self.server.fail_commit.swap(false, Ordering::SeqCst) {
            return Err(TransportError::new("commit refused"));
        }
        let pending = std::mem::take(&mut *self.pending.lock());
        for (routing_key, envelope) in pending {
            self.server.route(&routing_key, envelope)?;
        }
        Ok(())
    }

    async fn tx_rollback(&self) -> TransportResult<()> {
        self.ensure_usable()?;
        self.pending.lock().clear();
        if self.server.fail_rollback.swap(false, Ordering::SeqCst) {
            return Err(TransportError::new("rollback refused"));
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> TransportResult<()> {
        self.ensure_usable()?;
        let settled = self.take_unacked(delivery_tag)?;
        self.server.state.lock().acked.push(settled.1.message_id);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> TransportResult<()> {
        self.ensure_usable()?;
        let (queue, envelope) = self.take_unacked(delivery_tag)?;
        if requeue {
            self.server.requeue(&queue, envelope);
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        let was_open = self.shut();
        if !self.connection.is_alive() {
            return Err(TransportError::new("connection is closed"));
        }
        if !was_open {
            return Err(TransportError::new("channel is closed"));
        }
        Ok(())
    }
}

impl FakeChannel {
    /// Mark the channel closed, returning whether it was open
    fn shut(&self) -> bool {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        if was_open {
            self.server.channels_closed.fetch_add(1, Ordering::SeqCst);
            // Unsettled deliveries go back to their queues
            let unsettled: Vec<_> = self.unacked.lock().drain().collect();
            for (_, (queue, envelope)) in unsettled {
                self.server.requeue(&queue, envelope);
            }
        }
        self.server.changed.notify_waiters();
        was_open
    }

    fn take_unacked(&self, delivery_tag: u64) -> TransportResult<(String, Envelope)> {
        self.unacked
            .lock()
            .remove(&delivery_tag)
            .ok_or_else(|| TransportError::new(format!("unknown delivery tag {}", delivery_tag)))
    }
}
