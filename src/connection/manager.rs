use std::{
    collections::{HashMap, HashSet},
    fmt::Write as _,
    io,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::{
    config::NetworkConfig,
    error::NetworkError,
    node::NodeId,
    pool::Pool,
    protocol::read_handshake,
    request_map::RequestMap,
    worker::{Worker, join_all},
};

use super::{
    Connection, ConnectionContext, FrameSink,
    transport::{Link, Transport, TransportKind},
};

const ACCEPT_WAIT: Duration = Duration::from_millis(100);

/// Observer of connection lifecycle events.
pub trait ConnectionListener: Send + Sync {
    fn connection_created(&self, destination: NodeId);
    fn connection_lost(&self, destination: NodeId);
}

#[derive(Default)]
struct ManagerState {
    connections: HashMap<NodeId, Arc<Connection>>,
    /// Destinations with a dial in progress.
    dialing: HashSet<NodeId>,
    /// When the last dial to a destination failed.
    failures: HashMap<NodeId, Instant>,
    closed: bool,
}

struct Shared {
    own: NodeId,
    transport: Arc<dyn Transport>,
    requests: Arc<RequestMap>,
    context: Arc<ConnectionContext>,
    connection_timeout: Duration,
    unreachable_grace: Duration,
    max_connections: usize,
    state: Mutex<ManagerState>,
    dial_done: Condvar,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    closed: AtomicBool,
}

/// Owns the connections of one node, at most one per destination.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    acceptor: Mutex<Option<Worker>>,
    shutdown_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(
        config: &NetworkConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn FrameSink>,
        requests: Arc<RequestMap>,
    ) -> Result<Self, NetworkError> {
        let buffer_size = config.incoming_buffer_size;
        let buffers = Pool::new(
            config.incoming_buffer_pool_size,
            move || vec![0; buffer_size],
            |_| {},
        );

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let mut context =
                ConnectionContext::new(config.own_node_id, buffers, sink, move |connection| {
                    match weak.upgrade() {
                        Some(shared) => shared.connection_lost(connection),
                        None => connection.close(),
                    }
                });
            context.outgoing_buffer_size = config.outgoing_buffer_size;
            context.max_payload_size = config.max_payload_size;
            context.flow_control_window = config.flow_control_window;
            context.shutdown_timeout = config.shutdown_timeout;

            Shared {
                own: config.own_node_id,
                transport,
                requests,
                context: Arc::new(context),
                connection_timeout: config.connection_timeout,
                unreachable_grace: config.unreachable_grace,
                max_connections: config.max_connections.max(1),
                state: Mutex::new(ManagerState::default()),
                dial_done: Condvar::new(),
                listeners: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }
        });

        let acceptor = {
            let shared = Arc::clone(&shared);
            Worker::spawn(format!("nodenet-accept-{}", config.own_node_id), move || {
                shared.accept_loop()
            })?
        };

        info!(
            "connection manager of {} started over {}",
            config.own_node_id,
            shared.transport.kind()
        );

        Ok(Self {
            shared,
            acceptor: Mutex::new(Some(acceptor)),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.shared.transport.kind()
    }

    /// Returns the connection to `destination`, dialing it first if needed.
    ///
    /// Concurrent callers for the same destination wait for a single dial. A destination whose
    /// dial failed within the grace period is reported unreachable without dialing again.
    pub fn get_or_create(&self, destination: NodeId) -> Result<Arc<Connection>, NetworkError> {
        self.shared.get_or_create(destination, self.shared.connection_timeout)
    }

    /// Like [`ConnectionManager::get_or_create`], but gives up after `timeout` if that is shorter
    /// than the connection timeout, whether dialing or waiting on another caller's dial.
    pub fn get_or_create_within(
        &self,
        destination: NodeId,
        timeout: Duration,
    ) -> Result<Arc<Connection>, NetworkError> {
        self.shared.get_or_create(destination, timeout.min(self.shared.connection_timeout))
    }

    pub fn get(&self, destination: NodeId) -> Option<Arc<Connection>> {
        self.shared
            .lock_state()
            .connections
            .get(&destination)
            .cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock_state().connections.len()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn status(&self) -> String {
        let mut connections: Vec<_> = self
            .shared
            .lock_state()
            .connections
            .values()
            .cloned()
            .collect();
        connections.sort_by_key(|c| c.destination());

        let mut status = format!(
            "node {} over {}, {} connections\n",
            self.shared.own,
            self.transport_kind(),
            connections.len()
        );
        for connection in connections {
            let _ = writeln!(status, "  {}", connection.status());
        }
        status
    }

    /// Stops accepting and closes every connection, cancelling their outstanding requests.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.transport.close();

        let connections: Vec<_> = {
            let mut state = self.shared.lock_state();
            state.closed = true;
            state.connections.drain().map(|(_, c)| c).collect()
        };
        self.shared.dial_done.notify_all();

        if let Some(acceptor) = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            join_all([acceptor], self.shutdown_timeout);
        }

        for connection in connections {
            self.shared.discard(&connection);
        }
        info!("connection manager of {} closed", self.shared.own);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn get_or_create(
        &self,
        destination: NodeId,
        timeout: Duration,
    ) -> Result<Arc<Connection>, NetworkError> {
        if destination == self.own || !destination.is_valid() {
            return Err(NetworkError::InvalidDestination(destination));
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        loop {
            if state.closed {
                return Err(NetworkError::Closed);
            }

            if let Some(connection) = state.connections.get(&destination) {
                if connection.has_outgoing() && connection.is_connected() {
                    return Ok(Arc::clone(connection));
                }
            }

            if state.dialing.contains(&destination) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    debug!("gave up waiting for the dial to {destination}");
                    return Err(NetworkError::DestinationUnreachable(destination));
                }
                state = self
                    .dial_done
                    .wait_timeout(state, remaining)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }

            if let Some(failed) = state.failures.get(&destination) {
                if failed.elapsed() < self.unreachable_grace {
                    return Err(NetworkError::DestinationUnreachable(destination));
                }
                state.failures.remove(&destination);
            }

            state.dialing.insert(destination);
            break;
        }
        drop(state);

        let result = self
            .transport
            .dial(destination, timeout)
            .and_then(|link| self.establish(destination, link));

        let mut state = self.lock_state();
        state.dialing.remove(&destination);
        match &result {
            Ok(_) => {
                state.failures.remove(&destination);
            }
            Err(_) => {
                state.failures.insert(destination, Instant::now());
            }
        }
        drop(state);
        self.dial_done.notify_all();

        result.map_err(|e| {
            warn!("connecting to {destination} failed: {e}");
            NetworkError::DestinationUnreachable(destination)
        })
    }

    /// Binds a dialed link as the outgoing pipe of the connection to `destination`.
    fn establish(&self, destination: NodeId, link: Box<dyn Link>) -> io::Result<Arc<Connection>> {
        let (connection, created) = self.connection_for(destination)?;

        if let Err(e) = connection.attach_outgoing(link) {
            if created {
                self.remove(&connection);
                connection.close();
            }
            return Err(e);
        }

        if created {
            self.notify_created(destination);
        }
        Ok(connection)
    }

    /// Returns the live connection to `destination` or registers a new one, dismissing the
    /// least recently active connection if the limit is reached.
    fn connection_for(&self, destination: NodeId) -> io::Result<(Arc<Connection>, bool)> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection manager closed",
            ));
        }

        // a connection whose loss is still being reported is replaced here and cleaned up below
        let stale = match state.connections.get(&destination) {
            Some(connection) if connection.is_connected() => {
                return Ok((Arc::clone(connection), false));
            }
            Some(_) => state.connections.remove(&destination),
            None => None,
        };

        let dismissed = if state.connections.len() >= self.max_connections {
            let oldest = state
                .connections
                .values()
                .filter(|c| c.destination() != destination)
                .min_by_key(|c| c.last_activity())
                .map(|c| c.destination());
            oldest.and_then(|node| state.connections.remove(&node))
        } else {
            None
        };

        let connection = Connection::new(destination, Arc::clone(&self.context));
        state
            .connections
            .insert(destination, Arc::clone(&connection));
        drop(state);

        if let Some(stale) = stale {
            debug!("replacing lost connection to {destination}");
            self.discard(&stale);
        }
        if let Some(dismissed) = dismissed {
            info!(
                "connection limit of {} reached, dismissing {}",
                self.max_connections,
                dismissed.destination()
            );
            self.discard(&dismissed);
        }

        debug!("created connection to {destination}");
        Ok((connection, true))
    }

    fn remove(&self, connection: &Arc<Connection>) -> bool {
        let mut state = self.lock_state();
        let current = state.connections.get(&connection.destination());
        if current.is_some_and(|c| Arc::ptr_eq(c, connection)) {
            state.connections.remove(&connection.destination());
            return true;
        }
        false
    }

    /// Cleans up after a connection that is no longer in the map, then closes it.
    ///
    /// Listeners hear about the loss before the requests are cancelled, and both happen before
    /// `close` blocks joining the pipe threads.
    fn discard(&self, connection: &Arc<Connection>) {
        let destination = connection.destination();
        for listener in self.listeners() {
            listener.connection_lost(destination);
        }
        self.requests.remove_all(destination);
        connection.close();
    }

    /// Invoked by a pipe thread of `connection` when a link fails.
    fn connection_lost(&self, connection: &Arc<Connection>) {
        if self.remove(connection) {
            self.discard(connection);
        } else {
            connection.close();
        }
    }

    fn notify_created(&self, destination: NodeId) {
        for listener in self.listeners() {
            listener.connection_created(destination);
        }
    }

    fn accept_loop(&self) {
        while !self.closed.load(Ordering::Acquire) {
            match self.transport.accept(ACCEPT_WAIT) {
                Ok(Some(link)) => self.handle_incoming(link),
                Ok(None) => {}
                Err(e) => {
                    error!("accepting links failed: {e}");
                    thread::sleep(ACCEPT_WAIT);
                }
            }
        }
        debug!("accept loop of {} stopped", self.own);
    }

    fn handle_incoming(&self, mut link: Box<dyn Link>) {
        let peer = link.peer();
        let source = link
            .set_read_timeout(Some(self.connection_timeout))
            .and_then(|_| read_handshake(&mut link).map_err(io::Error::other))
            .and_then(|source| link.set_read_timeout(None).map(|_| source));

        let source = match source {
            Ok(source) if source.is_valid() && source != self.own => source,
            Ok(source) => {
                warn!("rejecting link from {peer} claiming to be {source}");
                link.shutdown();
                return;
            }
            Err(e) => {
                warn!("handshake with {peer} failed: {e}");
                link.shutdown();
                return;
            }
        };

        let (connection, created) = match self.connection_for(source) {
            Ok(found) => found,
            Err(e) => {
                debug!("dropping link from {source}: {e}");
                link.shutdown();
                return;
            }
        };

        if let Err(e) = connection.attach_incoming(link) {
            warn!("could not attach link from {source}: {e}");
            if created && self.remove(&connection) {
                connection.close();
            }
            return;
        }

        if created {
            self.notify_created(source);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::{
        connection::loopback::LoopbackHub,
        message::{Message, PendingRequest},
        protocol::Frame,
    };

    use super::*;

    #[derive(Default)]
    struct Collect {
        frames: Mutex<Vec<(NodeId, u64)>>,
    }

    impl FrameSink for Collect {
        fn accept(&self, source: NodeId, frames: Vec<Frame>) {
            let mut seen = self.frames.lock().unwrap();
            seen.extend(frames.iter().map(|f| (source, f.header.id)));
        }
    }

    #[derive(Default)]
    struct Events {
        log: Mutex<Vec<String>>,
    }

    impl ConnectionListener for Events {
        fn connection_created(&self, destination: NodeId) {
            self.log.lock().unwrap().push(format!("created {destination}"));
        }

        fn connection_lost(&self, destination: NodeId) {
            self.log.lock().unwrap().push(format!("lost {destination}"));
        }
    }

    struct Node {
        manager: ConnectionManager,
        sink: Arc<Collect>,
        requests: Arc<RequestMap>,
        events: Arc<Events>,
    }

    fn node(hub: &Arc<LoopbackHub>, id: u16, max_connections: usize) -> Node {
        let config = NetworkConfig::new(NodeId(id))
            .with_max_connections(max_connections)
            .with_connection_timeout(Duration::from_millis(200));
        let sink = Arc::new(Collect::default());
        let requests = Arc::new(RequestMap::new(1 << 16));
        let manager = ConnectionManager::new(
            &config,
            Arc::new(hub.transport(NodeId(id))),
            sink.clone(),
            Arc::clone(&requests),
        )
        .unwrap();

        let events = Arc::new(Events::default());
        manager.add_listener(events.clone());
        Node {
            manager,
            sink,
            requests,
            events,
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn message(id: u64) -> Message {
        let mut message = Message::new(NodeId(2), 5, 1);
        message.id = id;
        message
    }

    #[test]
    fn one_connection_per_destination() {
        let hub = LoopbackHub::new();
        let one = Arc::new(node(&hub, 1, 8));
        let two = node(&hub, 2, 8);

        let dialers: Vec<_> = (0..8)
            .map(|_| {
                let one = Arc::clone(&one);
                thread::spawn(move || one.manager.get_or_create(NodeId(2)).unwrap())
            })
            .collect();
        let connections: Vec<_> = dialers.into_iter().map(|d| d.join().unwrap()).collect();
        assert!(connections.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

        connections[0].write(&message(1)).unwrap();
        wait_for(|| two.sink.frames.lock().unwrap().len() == 1);
        assert_eq!(two.sink.frames.lock().unwrap()[0], (NodeId(1), 1));

        // the accepting side has a passive connection back
        assert_eq!(two.manager.connection_count(), 1);
        assert!(!two.manager.get(NodeId(1)).unwrap().has_outgoing());
        assert_eq!(*one.events.log.lock().unwrap(), vec!["created 0x0002"]);
    }

    #[test]
    fn own_node_is_not_a_destination() {
        let hub = LoopbackHub::new();
        let one = node(&hub, 1, 8);
        assert!(matches!(
            one.manager.get_or_create(NodeId(1)),
            Err(NetworkError::InvalidDestination(NodeId(1)))
        ));
    }

    #[test]
    fn failed_dial_is_remembered() {
        let hub = LoopbackHub::new();
        let one = node(&hub, 1, 8);

        assert!(matches!(
            one.manager.get_or_create(NodeId(9)),
            Err(NetworkError::DestinationUnreachable(NodeId(9)))
        ));

        // the node appears, but the failure is still fresh
        let _nine = node(&hub, 9, 8);
        assert!(matches!(
            one.manager.get_or_create(NodeId(9)),
            Err(NetworkError::DestinationUnreachable(NodeId(9)))
        ));

        thread::sleep(Duration::from_millis(1100));
        one.manager.get_or_create(NodeId(9)).unwrap();
    }

    #[test]
    fn loss_cancels_requests_and_notifies() {
        let hub = LoopbackHub::new();
        let one = node(&hub, 1, 8);
        let two = node(&hub, 2, 8);

        one.manager.get_or_create(NodeId(2)).unwrap();
        let pending = Arc::new(PendingRequest::new(5, NodeId(2)));
        one.requests.put(Arc::clone(&pending)).unwrap();
        wait_for(|| two.manager.connection_count() == 1);

        two.manager.close();

        assert!(matches!(
            pending.wait_for_response(Some(Duration::from_secs(5))),
            Err(NetworkError::ResponseCancelled(NodeId(2)))
        ));
        // cancelled requests imply the listeners have already heard
        assert!(
            one.events
                .log
                .lock()
                .unwrap()
                .contains(&"lost 0x0002".to_string())
        );
        wait_for(|| one.manager.connection_count() == 0);
    }

    #[test]
    fn replacing_a_lost_connection_reports_the_loss() {
        let hub = LoopbackHub::new();
        let one = node(&hub, 1, 8);
        let _two = node(&hub, 2, 8);

        let first = one.manager.get_or_create(NodeId(2)).unwrap();
        let pending = Arc::new(PendingRequest::new(5, NodeId(2)));
        one.requests.put(Arc::clone(&pending)).unwrap();

        // disconnected but still mapped, as while a pipe thread is reporting the loss
        first.close();
        let second = one.manager.get_or_create(NodeId(2)).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_connected());
        assert!(matches!(
            pending.wait_for_response(Some(Duration::from_secs(5))),
            Err(NetworkError::ResponseCancelled(NodeId(2)))
        ));
        assert_eq!(
            *one.events.log.lock().unwrap(),
            vec!["created 0x0002", "lost 0x0002", "created 0x0002"]
        );
    }

    #[test]
    fn least_recently_active_connection_is_dismissed() {
        let hub = LoopbackHub::new();
        let one = node(&hub, 1, 2);
        let _two = node(&hub, 2, 8);
        let _three = node(&hub, 3, 8);
        let _four = node(&hub, 4, 8);

        one.manager.get_or_create(NodeId(2)).unwrap();
        thread::sleep(Duration::from_millis(10));
        one.manager.get_or_create(NodeId(3)).unwrap();
        thread::sleep(Duration::from_millis(10));
        one.manager.get_or_create(NodeId(4)).unwrap();

        assert_eq!(one.manager.connection_count(), 2);
        assert!(one.manager.get(NodeId(2)).is_none());
        assert!(
            one.events
                .log
                .lock()
                .unwrap()
                .contains(&"lost 0x0002".to_string())
        );
    }

    #[test]
    fn status_lists_connections() {
        let hub = LoopbackHub::new();
        let one = node(&hub, 1, 8);
        let _two = node(&hub, 2, 8);
        one.manager.get_or_create(NodeId(2)).unwrap();

        let status = one.manager.status();
        assert!(status.contains("over loopback, 1 connections"));
        assert!(status.contains("0x0002: connected=true, outgoing=true"));
    }
}
