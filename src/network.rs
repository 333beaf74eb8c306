//! The engine facade.
//!
//! A [`Network`] owns everything one node needs: registries, the request map, handler threads
//! and the connection manager. Nothing is global; several engines can live in one process, which
//! is how the tests run whole clusters over the loopback transport.
use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::{debug, info, trace};

use crate::{
    config::NetworkConfig,
    connection::{
        FrameSink,
        manager::{ConnectionListener, ConnectionManager},
        transport::{TcpTransport, Transport},
    },
    error::NetworkError,
    handler::{Dispatcher, MessageHandlerPool},
    message::{
        Message, MessageConstructor, MessageIds, MessageReceiver, MessageRegistry,
        PendingRequest, ReceiverStore, Request,
    },
    node::{NodeId, NodeMap},
    request_map::RequestMap,
};

pub struct Network {
    own: NodeId,
    config: NetworkConfig,
    ids: MessageIds,
    registry: Arc<MessageRegistry>,
    receivers: Arc<ReceiverStore>,
    requests: Arc<RequestMap>,
    handlers: Mutex<MessageHandlerPool>,
    manager: ConnectionManager,
    closed: AtomicBool,
}

impl Network {
    /// Starts a node listening on the TCP address `nodes` has for it.
    pub fn new(config: NetworkConfig, nodes: Arc<dyn NodeMap>) -> Result<Self, NetworkError> {
        config.validate()?;
        let transport = TcpTransport::bind(nodes)?;
        Self::start(config, Arc::new(transport))
    }

    pub fn with_transport(
        config: NetworkConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, NetworkError> {
        config.validate()?;
        Self::start(config, transport)
    }

    fn start(config: NetworkConfig, transport: Arc<dyn Transport>) -> Result<Self, NetworkError> {
        let own = config.own_node_id;
        let registry = Arc::new(MessageRegistry::new());
        let receivers = Arc::new(ReceiverStore::new());
        let requests = Arc::new(RequestMap::new(config.request_map_size));

        let dispatcher = Arc::new(Dispatcher::new(
            own,
            Arc::clone(&registry),
            Arc::clone(&receivers),
            Arc::clone(&requests),
            config.request_timeout,
        ));
        let handlers = MessageHandlerPool::new(&config, Arc::clone(&registry), dispatcher)?;

        let sink: Arc<dyn FrameSink> = handlers.intake();
        let manager = ConnectionManager::new(&config, transport, sink, Arc::clone(&requests))?;

        info!("node {own} up");
        Ok(Self {
            own,
            config,
            ids: MessageIds::default(),
            registry,
            receivers,
            requests,
            handlers: Mutex::new(handlers),
            manager,
            closed: AtomicBool::new(false),
        })
    }

    pub fn own_node_id(&self) -> NodeId {
        self.own
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn register_type(
        &self,
        msg_type: u8,
        subtype: u8,
        constructor: MessageConstructor,
    ) -> Result<(), NetworkError> {
        self.registry.register(msg_type, subtype, constructor)
    }

    pub fn register_receiver(
        &self,
        msg_type: u8,
        subtype: u8,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Result<(), NetworkError> {
        self.receivers.register(msg_type, subtype, receiver)
    }

    /// Removes `receiver` if it is the one registered for the type. Returns whether it was.
    pub fn unregister_receiver(
        &self,
        msg_type: u8,
        subtype: u8,
        receiver: &Arc<dyn MessageReceiver>,
    ) -> bool {
        self.receivers.unregister(msg_type, subtype, receiver)
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.manager.add_listener(listener);
    }

    /// Establishes the connection to `destination` ahead of the first send.
    pub fn connect(&self, destination: NodeId) -> Result<(), NetworkError> {
        self.manager.get_or_create(destination).map(|_| ())
    }

    /// Sends `message` without waiting for anything but room in the outgoing buffer.
    ///
    /// Stamps the source and, unless the message is a response, a fresh id.
    pub fn send(&self, message: &mut Message) -> Result<(), NetworkError> {
        self.prepare(message)?;
        self.write(message, None)
    }

    /// Sends `request` and, if `wait` is set, blocks until its response arrives.
    ///
    /// `timeout` defaults to the configured request timeout and is ignored for requests built
    /// with [`Request::ignore_timeout`]. Without `wait` the caller collects the response later
    /// through [`Network::wait_for_response`].
    pub fn send_sync(
        &self,
        request: &mut Request,
        timeout: Option<Duration>,
        wait: bool,
    ) -> Result<(), NetworkError> {
        self.prepare(request.message_mut())?;

        let pending = Arc::new(PendingRequest::new(request.id(), request.destination()));
        self.requests.put(Arc::clone(&pending))?;
        request.attach(pending);

        let dial_limit = self.effective_timeout(request, timeout);
        if let Err(e) = self.write(request.message(), dial_limit) {
            self.requests.remove(request.id());
            return Err(e);
        }

        if wait {
            self.wait_for_response(request, timeout)
        } else {
            Ok(())
        }
    }

    /// Waits for the response of a request sent with [`Network::send_sync`]. On success the
    /// response is available through [`Request::response`].
    pub fn wait_for_response(
        &self,
        request: &mut Request,
        timeout: Option<Duration>,
    ) -> Result<(), NetworkError> {
        if request.is_fulfilled() {
            return Ok(());
        }
        let Some(pending) = request.pending().cloned() else {
            return Err(NetworkError::SendFailed {
                destination: request.destination(),
                reason: "request was never sent".to_string(),
            });
        };

        let timeout = self.effective_timeout(request, timeout);
        match pending.wait_for_response(timeout) {
            Ok(response) => {
                trace!("request {} fulfilled by {}", request.id(), response.source);
                request.complete(response);
                Ok(())
            }
            Err(e) => {
                self.requests.remove(request.id());
                Err(e)
            }
        }
    }

    /// Cancels every outstanding request to `destination`; their waiters see
    /// [`NetworkError::ResponseCancelled`].
    pub fn cancel_all_requests(&self, destination: NodeId) -> usize {
        self.requests.remove_all(destination)
    }

    pub fn status(&self) -> String {
        let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        format!(
            "{}outstanding requests: {}\ndefault lane: {} queued, support requested: {}\n",
            self.manager.status(),
            self.requests.outstanding(),
            handlers.default_lane_len(),
            handlers.support_requested(),
        )
    }

    /// Closes all connections, cancelling their requests, and stops the handler threads.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.manager.close();
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
        info!("node {} closed", self.own);
    }

    fn prepare(&self, message: &mut Message) -> Result<(), NetworkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::Closed);
        }

        let destination = message.destination;
        if destination == self.own || !destination.is_valid() {
            return Err(NetworkError::InvalidDestination(destination));
        }

        if message.payload.len() > self.config.max_payload_size {
            return Err(NetworkError::SendFailed {
                destination,
                reason: format!(
                    "payload of {} bytes exceeds the maximum of {}",
                    message.payload.len(),
                    self.config.max_payload_size
                ),
            });
        }

        message.source = self.own;
        if !message.is_response() {
            message.id = self.ids.next();
        }
        Ok(())
    }

    /// The bound on a request's wait, `None` for requests that ignore timeouts.
    fn effective_timeout(&self, request: &Request, timeout: Option<Duration>) -> Option<Duration> {
        if request.ignores_timeout() {
            None
        } else {
            Some(timeout.unwrap_or(self.config.request_timeout))
        }
    }

    fn write(&self, message: &Message, timeout: Option<Duration>) -> Result<(), NetworkError> {
        let connection = match timeout {
            Some(timeout) => self.manager.get_or_create_within(message.destination, timeout)?,
            None => self.manager.get_or_create(message.destination)?,
        };
        connection.write(message)?;
        debug!(
            "queued message {} ({}, {}) for {}",
            message.id, message.msg_type, message.subtype, message.destination
        );
        Ok(())
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.close();
    }
}
