use std::io;

use thiserror::Error;

use crate::{config::ConfigError, node::NodeId};

/// Errors surfaced to callers of the transport.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// No connection could be established, or the destination failed very recently.
    #[error("destination {0} is unreachable")]
    DestinationUnreachable(NodeId),

    /// The response did not arrive in time. The request was removed and may be retried.
    #[error("response from {0} delayed")]
    ResponseDelayed(NodeId),

    /// The destination went away while the request was outstanding.
    #[error("request to {0} cancelled")]
    ResponseCancelled(NodeId),

    #[error("sending to {destination} failed: {reason}")]
    SendFailed { destination: NodeId, reason: String },

    #[error("message type ({msg_type}, {subtype}) is already registered or reserved")]
    RegistrationConflict { msg_type: u8, subtype: u8 },

    /// Own node id, or an id that can not name a node.
    #[error("invalid destination {0}")]
    InvalidDestination(NodeId),

    #[error("request map slot {slot} still in use, request {id} collides")]
    RequestSlotInUse { id: u64, slot: usize },

    #[error("network is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("network IO error: {0}")]
    Io(#[from] io::Error),
}

impl NetworkError {
    /// Whether retrying the same call against the same destination can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NetworkError::ResponseDelayed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_delayed_responses_are_retryable() {
        assert!(NetworkError::ResponseDelayed(NodeId(1)).is_retryable());
        assert!(!NetworkError::ResponseCancelled(NodeId(1)).is_retryable());
        assert!(!NetworkError::DestinationUnreachable(NodeId(1)).is_retryable());
    }

    #[test]
    fn messages_name_the_node() {
        assert_eq!(
            NetworkError::DestinationUnreachable(NodeId(0x12)).to_string(),
            "destination 0x0012 is unreachable"
        );
    }
}
