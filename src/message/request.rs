use std::{
    mem,
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use bincode::Encode;
use log::trace;

use crate::{error::NetworkError, node::NodeId};

use super::{Message, MessageError, MessageKind};

#[derive(Debug)]
enum Outcome {
    Pending,
    Fulfilled(Message),
    Cancelled,
    Consumed,
}

/// Completion signal of a sent request. Shared between the caller and the request map.
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    destination: NodeId,
    outcome: Mutex<Outcome>,
    signal: Condvar,
}

impl PendingRequest {
    pub(crate) fn new(id: u64, destination: NodeId) -> Self {
        Self {
            id,
            destination,
            outcome: Mutex::new(Outcome::Pending),
            signal: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> NodeId {
        self.destination
    }

    /// Hands the response to the waiter. Returns false if the request was already resolved.
    pub(crate) fn fulfill(&self, response: Message) -> bool {
        let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*outcome, Outcome::Pending) {
            return false;
        }
        *outcome = Outcome::Fulfilled(response);
        self.signal.notify_one();
        true
    }

    pub(crate) fn cancel(&self) -> bool {
        let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*outcome, Outcome::Pending) {
            return false;
        }
        *outcome = Outcome::Cancelled;
        self.signal.notify_all();
        true
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(
            *self.outcome.lock().unwrap_or_else(PoisonError::into_inner),
            Outcome::Pending
        )
    }

    /// Blocks until the response arrives, the request is cancelled or `timeout` elapses. `None`
    /// waits without a deadline.
    pub fn wait_for_response(&self, timeout: Option<Duration>) -> Result<Message, NetworkError> {
        let outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = |outcome: &mut Outcome| matches!(outcome, Outcome::Pending);

        let mut outcome = match timeout {
            Some(timeout) => {
                self.signal
                    .wait_timeout_while(outcome, timeout, pending)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .signal
                .wait_while(outcome, pending)
                .unwrap_or_else(PoisonError::into_inner),
        };

        match mem::replace(&mut *outcome, Outcome::Consumed) {
            Outcome::Fulfilled(response) => Ok(response),
            Outcome::Pending => {
                *outcome = Outcome::Pending;
                Err(NetworkError::ResponseDelayed(self.destination))
            }
            Outcome::Cancelled => {
                *outcome = Outcome::Cancelled;
                Err(NetworkError::ResponseCancelled(self.destination))
            }
            Outcome::Consumed => {
                trace!("response to request {} was already taken", self.id);
                Err(NetworkError::ResponseCancelled(self.destination))
            }
        }
    }
}

/// A message that expects exactly one response.
#[derive(Debug)]
pub struct Request {
    message: Message,
    pending: Option<Arc<PendingRequest>>,
    response: Option<Message>,
    ignore_timeout: bool,
}

impl Request {
    pub fn new(destination: NodeId, msg_type: u8, subtype: u8) -> Self {
        Self::from_message(Message::new(destination, msg_type, subtype))
    }

    pub fn from_message(mut message: Message) -> Self {
        message.kind = MessageKind::Request;
        Self {
            message,
            pending: None,
            response: None,
            ignore_timeout: false,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.message.payload = payload;
        self
    }

    pub fn encode_payload<T: Encode>(&mut self, value: T) -> Result<(), MessageError> {
        self.message.encode_payload(value)
    }

    /// Waits for the response until it arrives or the destination is lost, whatever the timeout.
    pub fn ignore_timeout(mut self) -> Self {
        self.ignore_timeout = true;
        self
    }

    pub fn ignores_timeout(&self) -> bool {
        self.ignore_timeout
    }

    pub fn id(&self) -> u64 {
        self.message.id
    }

    pub fn destination(&self) -> NodeId {
        self.message.destination
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    pub fn response(&self) -> Option<&Message> {
        self.response.as_ref()
    }

    pub fn take_response(&mut self) -> Option<Message> {
        self.response.take()
    }

    pub fn is_fulfilled(&self) -> bool {
        self.response.is_some()
    }

    /// Starts a new round trip: forgets the previous response and signal.
    pub(crate) fn attach(&mut self, pending: Arc<PendingRequest>) {
        self.response = None;
        self.pending = Some(pending);
    }

    pub(crate) fn pending(&self) -> Option<&Arc<PendingRequest>> {
        self.pending.as_ref()
    }

    pub(crate) fn complete(&mut self, response: Message) {
        self.response = Some(response);
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use super::*;

    #[test]
    fn fulfilled_before_wait() {
        let pending = PendingRequest::new(3, NodeId(2));
        let mut response = Message::new(NodeId(1), 5, 2);
        response.id = 3;

        assert!(pending.fulfill(response.clone()));
        // only one response may fulfill a request
        assert!(!pending.fulfill(response.clone()));

        let got = pending
            .wait_for_response(Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(got, response);
    }

    #[test]
    fn wait_wakes_on_fulfill() {
        let pending = Arc::new(PendingRequest::new(3, NodeId(2)));

        let waiter = {
            let pending = Arc::clone(&pending);
            thread::spawn(move || pending.wait_for_response(Some(Duration::from_secs(5))))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(pending.fulfill(Message::new(NodeId(1), 5, 2).with_payload(vec![9])));

        let response = waiter.join().unwrap().unwrap();
        assert_eq!(response.payload, vec![9]);
    }

    #[test]
    fn delayed_and_cancelled_are_distinct() {
        let pending = PendingRequest::new(3, NodeId(2));

        let start = Instant::now();
        assert!(matches!(
            pending.wait_for_response(Some(Duration::from_millis(20))),
            Err(NetworkError::ResponseDelayed(NodeId(2)))
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));

        assert!(pending.cancel());
        assert!(matches!(
            pending.wait_for_response(None),
            Err(NetworkError::ResponseCancelled(NodeId(2)))
        ));
        assert!(!pending.fulfill(Message::default()));
    }

    #[test]
    fn request_marks_its_message() {
        let request = Request::new(NodeId(4), 5, 1).ignore_timeout();
        assert_eq!(request.message().kind, MessageKind::Request);
        assert!(request.ignores_timeout());
        assert!(request.response().is_none());
    }
}
