//! Messages exchanged between nodes.
//!
//! A [`Message`] is the unit of transfer. Its header fields travel on the wire (see
//! [`protocol`](crate::protocol)), while [`MessageKind`] and the exclusive flag are local: the
//! sender sets them and the receiver derives them again from its [`MessageRegistry`].
mod registry;
mod request;

use std::sync::atomic::{AtomicU64, Ordering};

use bincode::{Decode, Encode};
use thiserror::Error;

use crate::{node::NodeId, pool::Pool, protocol::wire_config};

pub use registry::{MessageConstructor, MessageReceiver, MessageRegistry, ReceiverStore};
pub use request::{PendingRequest, Request};

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode payload: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("invalid message ({msg_type}, {subtype}): {reason}")]
    Invalid {
        msg_type: u8,
        subtype: u8,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageKind {
    #[default]
    Message,
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Zero until the message is sent.
    pub id: u64,
    pub source: NodeId,
    pub destination: NodeId,
    pub msg_type: u8,
    pub subtype: u8,
    pub status: u8,
    /// Weight added to the connection's rating when the message is written.
    pub rating: u8,
    pub kind: MessageKind,
    /// Delivered in order on the single-threaded exclusive lane.
    pub exclusive: bool,
    pub payload: Vec<u8>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            id: 0,
            source: NodeId::INVALID,
            destination: NodeId::INVALID,
            msg_type: 0,
            subtype: 0,
            status: 0,
            rating: 0,
            kind: MessageKind::Message,
            exclusive: false,
            payload: Vec::new(),
        }
    }
}

impl Message {
    pub fn new(destination: NodeId, msg_type: u8, subtype: u8) -> Self {
        Self {
            destination,
            msg_type,
            subtype,
            ..Default::default()
        }
    }

    /// Builds the response to `request`: same id, addressed back to the request's source.
    pub fn response_to(request: &Message, msg_type: u8, subtype: u8) -> Self {
        Self {
            id: request.id,
            destination: request.source,
            msg_type,
            subtype,
            kind: MessageKind::Response,
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_status(mut self, status: u8) -> Self {
        self.status = status;
        self
    }

    pub fn with_rating(mut self, rating: u8) -> Self {
        self.rating = rating;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn is_response(&self) -> bool {
        self.kind == MessageKind::Response
    }

    /// Replaces the payload with the wire encoding of `value`.
    pub fn encode_payload<T: Encode>(&mut self, value: T) -> Result<(), MessageError> {
        self.payload = bincode::encode_to_vec(value, wire_config())?;
        Ok(())
    }

    pub fn decode_payload<T: Decode<()>>(&self) -> Result<T, MessageError> {
        let (value, _) = bincode::decode_from_slice(&self.payload, wire_config())?;
        Ok(value)
    }

    /// Clears every field while keeping the payload allocation.
    pub fn reset(&mut self) {
        let mut payload = std::mem::take(&mut self.payload);
        payload.clear();
        *self = Self {
            payload,
            ..Default::default()
        };
    }
}

/// Reusable messages for senders that produce many of them.
pub type MessagePool = Pool<Message>;

pub fn message_pool(capacity: usize) -> MessagePool {
    Pool::new(capacity, Message::default, Message::reset)
}

/// Source of message ids, owned by one engine.
#[derive(Debug)]
pub struct MessageIds {
    next: AtomicU64,
}

impl Default for MessageIds {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl MessageIds {
    pub fn next(&self) -> u64 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            // 0 marks an unsent message
            if id != 0 {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bincode::{Decode, Encode};

    use super::*;

    #[derive(Debug, PartialEq, Encode, Decode)]
    struct Put {
        key: u64,
        value: String,
    }

    #[test]
    fn typed_payload() {
        let mut message = Message::new(NodeId(2), 4, 1);
        let put = Put {
            key: 42,
            value: "hello".to_string(),
        };

        message.encode_payload(&put).unwrap();
        // fixed-width big-endian key first
        assert_eq!(&message.payload[..8], &42u64.to_be_bytes());
        assert_eq!(message.decode_payload::<Put>().unwrap(), put);
    }

    #[test]
    fn truncated_payload_fails_to_decode() {
        let message = Message::new(NodeId(2), 4, 1).with_payload(vec![0, 0, 0]);
        assert!(matches!(
            message.decode_payload::<u64>(),
            Err(MessageError::Decode(_))
        ));
    }

    #[test]
    fn response_mirrors_request() {
        let mut request = Message::new(NodeId(2), 4, 1);
        request.id = 77;
        request.source = NodeId(1);

        let response = Message::response_to(&request, 4, 2);
        assert_eq!(response.id, 77);
        assert_eq!(response.destination, NodeId(1));
        assert!(response.is_response());
    }

    #[test]
    fn ids_are_unique_and_never_zero() {
        let ids = MessageIds::default();
        let a = ids.next();
        let b = ids.next();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn pooled_messages_come_back_clean() {
        let pool = message_pool(1);
        {
            let mut message = pool.checkout();
            message.msg_type = 9;
            message.payload.extend_from_slice(b"abc");
        }

        let message = pool.checkout();
        assert_eq!(message.msg_type, 0);
        assert!(message.payload.is_empty());
        assert!(message.payload.capacity() >= 3);
    }
}
