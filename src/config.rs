//! Engine configuration.
//!
//! The transport consumes a [`NetworkConfig`] but does not load it from anywhere: binaries build
//! it from command line arguments, tests from [`NetworkConfig::default`] and the `with_*` setters.
//! [`NetworkConfig::validate`] enforces the startup constraints and is called by
//! [`Network`](crate::Network) before any thread is spawned.
use std::time::Duration;

use log::warn;
use thiserror::Error;

use crate::{handler::backoff::BackoffPolicy, node::NodeId};

/// Largest buffer the 32-bit length field can describe.
pub const MAX_BUFFER_SIZE: usize = 1 << 31;

/// Request maps at or below this size are likely to see slot collisions.
pub const REQUEST_MAP_WARN_SIZE: usize = 1 << 15;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("own node id must be valid")]
    InvalidOwnNodeId,

    #[error("[{name}] must not be zero")]
    Zero { name: &'static str },

    #[error("[{name}] of {size} bytes exceeds the 2 GiB limit")]
    TooLarge { name: &'static str, size: usize },

    #[error("flow control window {window} x 2 exceeds outgoing buffer size {buffer}")]
    FlowControlWindow { window: usize, buffer: usize },

    #[error("[{name}] capacity {capacity} must be a power of two")]
    NotPowerOfTwo { name: &'static str, capacity: usize },
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub own_node_id: NodeId,
    /// Bytes a connection may buffer for sending before writers block.
    pub outgoing_buffer_size: usize,
    /// Size of one pooled receive buffer, i.e. the largest single network read.
    pub incoming_buffer_size: usize,
    /// Receive buffers kept around for reuse.
    pub incoming_buffer_pool_size: usize,
    pub max_payload_size: usize,
    pub request_map_size: usize,
    pub request_timeout: Duration,
    pub connection_timeout: Duration,
    /// A destination that failed to connect is reported unreachable for this long.
    pub unreachable_grace: Duration,
    /// Unconfirmed bytes allowed in flight per connection; zero disables flow control.
    pub flow_control_window: usize,
    pub default_handler_threads: usize,
    pub default_queue_capacity: usize,
    pub exclusive_queue_capacity: usize,
    pub max_connections: usize,
    pub backoff: BackoffPolicy,
    /// How long shutdown waits for each thread before giving up on it.
    pub shutdown_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            own_node_id: NodeId(0),
            outgoing_buffer_size: 2 * 1024 * 1024,
            incoming_buffer_size: 64 * 1024,
            incoming_buffer_pool_size: 64,
            max_payload_size: 64 * 1024 * 1024,
            request_map_size: 1 << 16,
            request_timeout: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(1),
            unreachable_grace: Duration::from_secs(1),
            flow_control_window: 1024 * 1024,
            default_handler_threads: 2,
            default_queue_capacity: 4096,
            exclusive_queue_capacity: 1024,
            max_connections: 256,
            backoff: BackoffPolicy::default(),
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

impl NetworkConfig {
    pub fn new(own_node_id: NodeId) -> Self {
        Self {
            own_node_id,
            ..Default::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_flow_control_window(mut self, window: usize) -> Self {
        self.flow_control_window = window;
        self
    }

    pub fn with_outgoing_buffer_size(mut self, size: usize) -> Self {
        self.outgoing_buffer_size = size;
        self
    }

    pub fn with_incoming_buffer_size(mut self, size: usize) -> Self {
        self.incoming_buffer_size = size;
        self
    }

    pub fn with_handler_threads(mut self, threads: usize) -> Self {
        self.default_handler_threads = threads;
        self
    }

    pub fn with_queue_capacities(mut self, default: usize, exclusive: usize) -> Self {
        self.default_queue_capacity = default;
        self.exclusive_queue_capacity = exclusive;
        self
    }

    pub fn with_request_map_size(mut self, size: usize) -> Self {
        self.request_map_size = size;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Checks the startup constraints. Problems that only degrade behaviour are logged as
    /// warnings instead of failing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.own_node_id.is_valid() {
            return Err(ConfigError::InvalidOwnNodeId);
        }

        for (name, size) in [
            ("outgoing_buffer_size", self.outgoing_buffer_size),
            ("incoming_buffer_size", self.incoming_buffer_size),
            ("max_payload_size", self.max_payload_size),
        ] {
            if size == 0 {
                return Err(ConfigError::Zero { name });
            }
            if size > MAX_BUFFER_SIZE {
                return Err(ConfigError::TooLarge { name, size });
            }
        }

        for (name, value) in [
            ("request_map_size", self.request_map_size),
            ("default_handler_threads", self.default_handler_threads),
            ("max_connections", self.max_connections),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }

        if self.flow_control_window.saturating_mul(2) > self.outgoing_buffer_size {
            return Err(ConfigError::FlowControlWindow {
                window: self.flow_control_window,
                buffer: self.outgoing_buffer_size,
            });
        }

        for (name, capacity) in [
            ("default_queue", self.default_queue_capacity),
            ("exclusive_queue", self.exclusive_queue_capacity),
        ] {
            if !capacity.is_power_of_two() {
                return Err(ConfigError::NotPowerOfTwo { name, capacity });
            }
        }

        if self.request_map_size <= REQUEST_MAP_WARN_SIZE {
            warn!(
                "request map size {} is small, responses may be lost to slot collisions",
                self.request_map_size
            );
        }

        Ok(())
    }
}
