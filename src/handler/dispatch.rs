use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{error, trace, warn};

use crate::{
    message::{Message, MessageKind, MessageReceiver, MessageRegistry, ReceiverStore},
    node::NodeId,
    protocol::MessageHeader,
    request_map::RequestMap,
};

const RECEIVER_POLL: Duration = Duration::from_millis(1);

/// Final stage of the receive path, run on handler threads.
pub struct Dispatcher {
    own: NodeId,
    registry: Arc<MessageRegistry>,
    receivers: Arc<ReceiverStore>,
    requests: Arc<RequestMap>,
    /// How long a message waits for a receiver that is not registered yet.
    receiver_wait: Duration,
    running: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        own: NodeId,
        registry: Arc<MessageRegistry>,
        receivers: Arc<ReceiverStore>,
        requests: Arc<RequestMap>,
        receiver_wait: Duration,
    ) -> Self {
        Self {
            own,
            registry,
            receivers,
            requests,
            receiver_wait,
            running: AtomicBool::new(true),
        }
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Materializes a default-lane header and delivers it.
    pub fn handle_header(&self, header: MessageHeader) {
        let message = header.materialize(self.own);
        let (msg_type, subtype) = (message.msg_type, message.subtype);

        let Some(constructor) = self.registry.lookup(msg_type, subtype) else {
            warn!(
                "dropping message {} of unknown type ({msg_type}, {subtype}) from {}",
                message.id, message.source
            );
            return;
        };

        match constructor.construct(message) {
            Ok(message) => self.deliver(message),
            Err(e) => warn!("dropping invalid message ({msg_type}, {subtype}): {e}"),
        }
    }

    /// Routes a constructed message to the request map or to its receiver.
    pub fn deliver(&self, message: Message) {
        if message.kind == MessageKind::Response {
            let id = message.id;
            if !self.requests.fulfill(message) {
                trace!("response {id} arrived after its request was resolved");
            }
            return;
        }

        let (msg_type, subtype) = (message.msg_type, message.subtype);
        let Some(receiver) = self.receiver(msg_type, subtype) else {
            warn!(
                "no receiver for ({msg_type}, {subtype}), dropping message {} from {}",
                message.id, message.source
            );
            return;
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| receiver.on_message(message)));
        if result.is_err() {
            error!("receiver for ({msg_type}, {subtype}) panicked");
        }
    }

    /// Looks up the receiver, giving a late registration until `receiver_wait` to show up.
    fn receiver(&self, msg_type: u8, subtype: u8) -> Option<Arc<dyn MessageReceiver>> {
        if let Some(receiver) = self.receivers.get(msg_type, subtype) {
            return Some(receiver);
        }

        let deadline = Instant::now() + self.receiver_wait;
        while Instant::now() < deadline && self.running.load(Ordering::Acquire) {
            thread::sleep(RECEIVER_POLL);
            if let Some(receiver) = self.receivers.get(msg_type, subtype) {
                return Some(receiver);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::message::{MessageConstructor, PendingRequest};

    use super::*;

    fn dispatcher(wait: Duration) -> Dispatcher {
        Dispatcher::new(
            NodeId(1),
            Arc::new(MessageRegistry::new()),
            Arc::new(ReceiverStore::new()),
            Arc::new(RequestMap::new(64)),
            wait,
        )
    }

    #[test]
    fn responses_fulfill_requests() {
        let dispatcher = dispatcher(Duration::ZERO);
        let pending = Arc::new(PendingRequest::new(9, NodeId(2)));
        dispatcher.requests.put(Arc::clone(&pending)).unwrap();

        let mut response = Message::new(NodeId(1), 5, 2);
        response.id = 9;
        response.kind = MessageKind::Response;
        dispatcher.deliver(response);

        assert!(pending.is_resolved());
    }

    #[test]
    fn late_receiver_still_gets_the_message() {
        let dispatcher = Arc::new(dispatcher(Duration::from_secs(2)));
        dispatcher
            .registry
            .register(5, 1, MessageConstructor::message())
            .unwrap();

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let worker = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || dispatcher.deliver(Message::new(NodeId(1), 5, 1)))
        };

        thread::sleep(Duration::from_millis(20));
        let sink = Arc::clone(&delivered);
        dispatcher
            .receivers
            .register(
                5,
                1,
                Arc::new(move |message: Message| sink.lock().unwrap().push(message)),
            )
            .unwrap();

        worker.join().unwrap();
        assert_eq!(delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn panicking_receiver_does_not_unwind_into_the_worker() {
        fn explode(_: Message) {
            panic!("receiver failure");
        }

        let dispatcher = dispatcher(Duration::ZERO);
        dispatcher.receivers.register(5, 1, Arc::new(explode)).unwrap();

        dispatcher.deliver(Message::new(NodeId(1), 5, 1));
    }

    #[test]
    fn missing_receiver_gives_up() {
        let dispatcher = dispatcher(Duration::from_millis(10));
        let start = Instant::now();
        dispatcher.deliver(Message::new(NodeId(1), 5, 1));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
