//! Worker connection handler.
//!
//! Worker processes connect on their own port. Each socket gets a
//! [`WorkerConnection`] that the dispatch layer pushes packets to, plus two
//! tasks: a read loop that turns responses and acks into [`WorkerDispatch`]
//! callbacks, and a writer that drains the connection's outbound queue.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::ConnectionError;
use super::writer::PacketWriter;
use crate::bridge::codec::{DEFAULT_MAX_BODY_SIZE, PacketCodec};
use crate::bridge::protocol::{Packet, ProtocolViolation, Role, WorkerMessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("worker is deregistered or disconnected")]
    Invalid,

    #[error("no valid workers connected")]
    NoWorkers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callbacks into the job-routing layer.
///
/// Called inline from a worker's read loop; implementations must not block.
pub trait WorkerDispatch: Send + Sync {
    fn on_worker_response(&self, packet: Packet);
    fn on_worker_ack(&self, packet: Packet);
}

/// Dispatch that only logs. Used when no router is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDispatch;

impl WorkerDispatch for LoggingDispatch {
    fn on_worker_response(&self, packet: Packet) {
        tracing::info!(key = %packet.key(), body_size = packet.body.len(), "Worker response");
    }

    fn on_worker_ack(&self, packet: Packet) {
        tracing::info!(key = %packet.key(), "Worker ack");
    }
}

/// Outbound side of one worker socket.
#[derive(Debug)]
pub struct WorkerConnection {
    id: WorkerId,
    peer: SocketAddr,
    valid: AtomicBool,
    outbound: mpsc::UnboundedSender<Packet>,
}

impl WorkerConnection {
    fn new(peer: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Packet>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Self {
            id: WorkerId::new(),
            peer,
            valid: AtomicBool::new(true),
            outbound,
        };
        (conn, rx)
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// False once the worker has deregistered, disconnected or failed a write.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            tracing::info!(worker_id = %self.id, peer = %self.peer, "Worker invalidated");
        }
    }

    /// Queue a packet for this worker. Writes happen in call order on one task.
    ///
    /// Rejected with [`WorkerError::Invalid`] once the worker is invalid; nothing is written.
    pub fn start_post(&self, packet: Packet) -> Result<(), WorkerError> {
        if !self.is_valid() {
            return Err(WorkerError::Invalid);
        }
        self.outbound.send(packet).map_err(|_| {
            self.invalidate();
            WorkerError::Invalid
        })
    }
}

/// Starts worker sessions with a shared dispatch target.
#[derive(Clone)]
pub struct WorkerHandler {
    dispatch: Arc<dyn WorkerDispatch>,
    max_body_size: usize,
}

impl WorkerHandler {
    pub fn new(dispatch: Arc<dyn WorkerDispatch>) -> Self {
        Self {
            dispatch,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    pub fn with_max_body_size(mut self, max: usize) -> Self {
        self.max_body_size = max;
        self
    }

    pub fn spawn_tcp(
        &self,
        stream: TcpStream,
        cancel: CancellationToken,
    ) -> Result<(Arc<WorkerConnection>, JoinHandle<()>), ConnectionError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(self.spawn(reader, writer, peer, cancel))
    }

    /// Start the read loop and writer for one worker socket.
    ///
    /// The returned task finishes when the worker disconnects, a read or write
    /// fails, or `cancel` fires; the connection is invalid by then.
    pub fn spawn<R, W>(
        &self,
        reader: R,
        writer: W,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> (Arc<WorkerConnection>, JoinHandle<()>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (conn, outbound) = WorkerConnection::new(peer);
        let conn = Arc::new(conn);
        tracing::info!(worker_id = %conn.id, %peer, "Worker connected");

        let codec = PacketCodec::new(Role::Worker).with_max_body_size(self.max_body_size);
        let reader = FramedRead::new(reader, codec);
        let writer = PacketWriter::new(writer, Role::Worker);

        let task = tokio::spawn(run_session(
            Arc::clone(&conn),
            reader,
            writer,
            outbound,
            Arc::clone(&self.dispatch),
            cancel,
        ));
        (conn, task)
    }
}

async fn run_session<R, W>(
    conn: Arc<WorkerConnection>,
    mut reader: FramedRead<R, PacketCodec>,
    writer: PacketWriter<W>,
    outbound: mpsc::UnboundedReceiver<Packet>,
    dispatch: Arc<dyn WorkerDispatch>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer_task = tokio::spawn(drain_outbound(
        Arc::clone(&conn),
        writer,
        outbound,
        cancel.clone(),
    ));

    let result = read_loop(&conn, &mut reader, dispatch.as_ref(), &cancel).await;

    conn.invalidate();
    cancel.cancel();
    if let Err(e) = writer_task.await {
        tracing::error!(worker_id = %conn.id, error = %e, "Worker writer task failed");
    }

    match result {
        Ok(()) => tracing::debug!(worker_id = %conn.id, peer = %conn.peer, "Worker connection closed"),
        Err(e) => tracing::error!(worker_id = %conn.id, peer = %conn.peer, error = %e, "Worker connection failed"),
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    conn: &WorkerConnection,
    reader: &mut FramedRead<R, PacketCodec>,
    dispatch: &dyn WorkerDispatch,
    cancel: &CancellationToken,
) -> Result<(), ConnectionError> {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = reader.next() => match next {
                Some(Ok(packet)) => packet,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
        };

        let key = packet.header.key;
        match packet.header.worker_type() {
            Ok(WorkerMessageType::WorkerDereg) => {
                tracing::info!(worker_id = %conn.id, "Worker deregistered");
                conn.invalidate();
            }
            Ok(WorkerMessageType::WorkerResponse) => {
                tracing::trace!(worker_id = %conn.id, %key, body_size = packet.body.len(), "Worker response received");
                dispatch.on_worker_response(packet);
            }
            Ok(WorkerMessageType::Ack) => {
                tracing::trace!(worker_id = %conn.id, %key, "Worker ack received");
                dispatch.on_worker_ack(packet);
            }
            Ok(other) => {
                let violation = ProtocolViolation::UnexpectedType {
                    role: Role::Worker,
                    name: other.as_str(),
                };
                tracing::warn!(worker_id = %conn.id, %key, %violation, "Ignoring packet");
            }
            Err(violation) => {
                tracing::warn!(worker_id = %conn.id, %key, %violation, "Ignoring packet");
            }
        }
    }
}

async fn drain_outbound<W: AsyncWrite + Unpin>(
    conn: Arc<WorkerConnection>,
    writer: PacketWriter<W>,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => return,
            },
        };

        let key = packet.header.key;
        if let Err(e) = writer.send(packet).await {
            tracing::error!(worker_id = %conn.id, %key, error = %e, "Failed to write to worker");
            conn.invalidate();
            cancel.cancel();
            return;
        }
        tracing::trace!(worker_id = %conn.id, %key, "Packet written to worker");
    }
}

#[derive(Default)]
struct RegistryInner {
    workers: Vec<Arc<WorkerConnection>>,
    next: usize,
}

/// Connected workers, in connection order.
#[derive(Default)]
pub struct WorkerRegistry {
    inner: Mutex<RegistryInner>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, worker: Arc<WorkerConnection>) {
        self.inner().workers.push(worker);
    }

    pub fn remove(&self, id: &WorkerId) -> Option<Arc<WorkerConnection>> {
        let mut inner = self.inner();
        let idx = inner.workers.iter().position(|w| w.id == *id)?;
        Some(inner.workers.remove(idx))
    }

    /// Drop invalid workers; returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut inner = self.inner();
        let before = inner.workers.len();
        inner.workers.retain(|w| w.is_valid());
        before - inner.workers.len()
    }

    /// Post to the next valid worker in round-robin order.
    pub fn push(&self, packet: Packet) -> Result<WorkerId, WorkerError> {
        let mut inner = self.inner();
        inner.workers.retain(|w| w.is_valid());

        for _ in 0..inner.workers.len() {
            let idx = inner.next % inner.workers.len();
            inner.next = inner.next.wrapping_add(1);

            let worker = &inner.workers[idx];
            if worker.start_post(packet.clone()).is_ok() {
                return Ok(worker.id);
            }
        }
        Err(WorkerError::NoWorkers)
    }

    pub fn len(&self) -> usize {
        self.inner().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner().workers.is_empty()
    }
}
