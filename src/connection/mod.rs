//! Connections to other nodes.
//!
//! A [`Connection`] is the single logical channel to one destination. It is made of pipes:
//!
//! - at most one outgoing pipe, a link this node dialed. A writer thread drains the connection's
//!   outgoing buffer into it, and a credit reader thread reads the flow control confirmations the
//!   peer sends back on the same link.
//! - any number of incoming pipes, links the peer dialed and this node accepted, each served by
//!   a reader thread that decodes frames and hands them to the handler lanes.
//!
//! Every node writes messages only on links it dialed and reads messages only on links it
//! accepted, so two nodes dialing each other at the same time end up with one pipe per
//! direction instead of two competing channels. End of stream or an I/O error on any pipe loses
//! the whole connection.
mod flow;
pub mod loopback;
pub mod manager;
mod outbox;
mod pipe;
pub mod transport;

use std::{
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    error::NetworkError,
    message::Message,
    node::NodeId,
    pool::Pool,
    protocol::{Frame, write_handshake},
    worker::{Worker, join_all},
};

pub use flow::{FlowControl, ReceiveWindow};
pub use outbox::{OutboxError, OutgoingBuffer};
pub use pipe::IncomingPipe;
use transport::Link;

/// Consumer of the frames decoded by incoming pipes.
pub trait FrameSink: Send + Sync {
    fn accept(&self, source: NodeId, frames: Vec<Frame>);
}

type LossHandler = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Everything the connections of one manager share.
pub struct ConnectionContext {
    pub own: NodeId,
    pub buffers: Pool<Vec<u8>>,
    pub sink: Arc<dyn FrameSink>,
    pub outgoing_buffer_size: usize,
    pub max_payload_size: usize,
    pub flow_control_window: usize,
    pub shutdown_timeout: Duration,
    on_lost: LossHandler,
}

impl ConnectionContext {
    pub fn new(
        own: NodeId,
        buffers: Pool<Vec<u8>>,
        sink: Arc<dyn FrameSink>,
        on_lost: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            own,
            buffers,
            sink,
            outgoing_buffer_size: 2 * 1024 * 1024,
            max_payload_size: 64 * 1024 * 1024,
            flow_control_window: 1024 * 1024,
            shutdown_timeout: Duration::from_secs(2),
            on_lost: Box::new(on_lost),
        }
    }
}

pub struct Connection {
    destination: NodeId,
    context: Arc<ConnectionContext>,
    connected: AtomicBool,
    closed: AtomicBool,
    outgoing: AtomicBool,
    epoch: Instant,
    /// Milliseconds after `epoch`.
    last_activity: AtomicU64,
    rating: AtomicU64,
    outbox: OutgoingBuffer,
    flow: FlowControl,
    links: Mutex<Vec<Box<dyn Link>>>,
    workers: Mutex<Vec<Worker>>,
}

impl Connection {
    pub fn new(destination: NodeId, context: Arc<ConnectionContext>) -> Arc<Self> {
        Arc::new(Self {
            destination,
            outbox: OutgoingBuffer::new(context.outgoing_buffer_size),
            flow: FlowControl::new(context.flow_control_window),
            context,
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            outgoing: AtomicBool::new(false),
            epoch: Instant::now(),
            last_activity: AtomicU64::new(0),
            rating: AtomicU64::new(0),
            links: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn destination(&self) -> NodeId {
        self.destination
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether this node dialed the destination and can send to it.
    pub fn has_outgoing(&self) -> bool {
        self.outgoing.load(Ordering::Acquire)
    }

    /// Sum of the ratings of all messages written so far.
    pub fn rating(&self) -> u64 {
        self.rating.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_activity.load(Ordering::Relaxed))
    }

    pub fn buffered(&self) -> usize {
        self.outbox.len()
    }

    fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_activity.store(elapsed, Ordering::Relaxed);
    }

    /// Queues `message` for the writer thread. Blocks while the outgoing buffer is full.
    pub fn write(&self, message: &Message) -> Result<(), NetworkError> {
        if !self.is_connected() {
            return Err(NetworkError::SendFailed {
                destination: self.destination,
                reason: "connection closed".to_string(),
            });
        }

        self.outbox
            .push(message)
            .map_err(|e| NetworkError::SendFailed {
                destination: self.destination,
                reason: e.to_string(),
            })?;

        self.rating
            .fetch_add(u64::from(message.rating), Ordering::Relaxed);
        self.touch();
        Ok(())
    }

    /// Adds a freshly dialed link as the outgoing pipe: writes the handshake and starts the
    /// writer and credit reader threads.
    pub fn attach_outgoing(self: &Arc<Self>, mut link: Box<dyn Link>) -> io::Result<()> {
        write_handshake(&mut link, self.context.own).map_err(io::Error::other)?;
        let credit_link = link.try_clone_link()?;

        let mut workers = self.lock_workers();
        if !self.register_link(&*link)? {
            return Err(closed_error(self.destination));
        }

        let writer = {
            let connection = Arc::clone(self);
            Worker::spawn(format!("nodenet-writer-{}", self.destination), move || {
                pipe::run_writer(connection, link)
            })?
        };
        workers.push(writer);

        let credit = {
            let connection = Arc::clone(self);
            Worker::spawn(format!("nodenet-credit-{}", self.destination), move || {
                pipe::run_credit_reader(connection, credit_link)
            })?
        };
        workers.push(credit);

        self.outgoing.store(true, Ordering::Release);
        self.touch();
        debug!("outgoing pipe to {} established", self.destination);
        Ok(())
    }

    /// Adds an accepted link, whose handshake was already read, as an incoming pipe.
    pub fn attach_incoming(self: &Arc<Self>, link: Box<dyn Link>) -> io::Result<()> {
        let mut workers = self.lock_workers();
        if !self.register_link(&*link)? {
            return Err(closed_error(self.destination));
        }

        let incoming = IncomingPipe::new(
            self.destination,
            link,
            self.context.buffers.clone(),
            self.context.max_payload_size,
            self.context.flow_control_window,
        );

        let connection = Arc::clone(self);
        workers.push(Worker::spawn(
            format!("nodenet-reader-{}", self.destination),
            move || pipe::run_incoming(connection, incoming),
        )?);

        self.touch();
        debug!("incoming pipe from {} established", self.destination);
        Ok(())
    }

    /// Keeps a handle for shutting the link down on close. Returns false, and shuts the link
    /// down right away, if the connection is closed already.
    fn register_link(&self, link: &dyn Link) -> io::Result<bool> {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            link.shutdown();
            return Ok(false);
        }
        links.push(link.try_clone_link()?);
        Ok(true)
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by pipe threads when a link fails. Only the first report has an effect.
    fn report_lost(self: &Arc<Self>, reason: &str) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        warn!("connection to {} lost: {reason}", self.destination);
        (self.context.on_lost)(self);
    }

    /// Shuts all pipes down and stops their threads. Idempotent; may be called from a pipe
    /// thread, which is then left to finish on its own.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        self.outbox.close();
        self.flow.close();

        for link in self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            link.shutdown();
        }

        let workers: Vec<_> = self.lock_workers().drain(..).collect();
        join_all(workers, self.context.shutdown_timeout);
        debug!("connection to {} closed", self.destination);
    }

    pub fn status(&self) -> String {
        format!(
            "{}: connected={}, outgoing={}, rating={}, buffered={}B, unconfirmed={}B, idle={:?}",
            self.destination,
            self.is_connected(),
            self.has_outgoing(),
            self.rating(),
            self.buffered(),
            self.flow.unconfirmed(),
            self.last_activity().elapsed(),
        )
    }
}

fn closed_error(destination: NodeId) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        format!("connection to {destination} is closed"),
    )
}
