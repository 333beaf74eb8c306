use std::{
    mem,
    sync::{Condvar, Mutex, PoisonError},
    time::Duration,
};

use thiserror::Error;

use crate::{
    message::Message,
    protocol::{FrameError, encode_message},
};

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Default)]
struct OutboxState {
    bytes: Vec<u8>,
    closed: bool,
}

/// Encoded frames waiting for the writer thread of a connection.
///
/// Producers block while the buffer holds `capacity` bytes or more. A single frame larger than
/// the capacity is still accepted into an empty buffer.
#[derive(Debug)]
pub struct OutgoingBuffer {
    capacity: usize,
    state: Mutex<OutboxState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl OutgoingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(OutboxState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn push(&self, message: &Message) -> Result<(), OutboxError> {
        let frame_len = crate::protocol::HEADER_SIZE + message.payload.len();
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let mut state = self
            .not_full
            .wait_while(state, |s| {
                !s.closed && !s.bytes.is_empty() && s.bytes.len() + frame_len > self.capacity
            })
            .unwrap_or_else(PoisonError::into_inner);

        if state.closed {
            return Err(OutboxError::Closed);
        }

        let start = state.bytes.len();
        if let Err(e) = encode_message(message, &mut state.bytes) {
            state.bytes.truncate(start);
            return Err(e.into());
        }

        self.not_empty.notify_one();
        Ok(())
    }

    /// Takes up to `max` bytes from the front, waiting up to `timeout` for data. Returns `None`
    /// once the buffer is closed and drained.
    pub fn take(&self, max: usize, timeout: Duration) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut state, _) = self
            .not_empty
            .wait_timeout_while(state, timeout, |s| s.bytes.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        if state.bytes.is_empty() {
            return if state.closed { None } else { Some(Vec::new()) };
        }

        let chunk = if state.bytes.len() <= max {
            mem::take(&mut state.bytes)
        } else {
            let rest = state.bytes.split_off(max);
            mem::replace(&mut state.bytes, rest)
        };

        self.not_full.notify_all();
        Some(chunk)
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bytes
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use crate::{node::NodeId, protocol::HEADER_SIZE};

    use super::*;

    fn message(len: usize) -> Message {
        Message::new(NodeId(2), 5, 1).with_payload(vec![1; len])
    }

    #[test]
    fn frames_come_out_in_order() {
        let outbox = OutgoingBuffer::new(1024);
        outbox.push(&message(4)).unwrap();
        outbox.push(&message(8)).unwrap();
        assert_eq!(outbox.len(), 2 * HEADER_SIZE + 12);

        let first = outbox.take(HEADER_SIZE + 4, Duration::ZERO).unwrap();
        assert_eq!(first.len(), HEADER_SIZE + 4);
        let rest = outbox.take(1024, Duration::ZERO).unwrap();
        assert_eq!(rest.len(), HEADER_SIZE + 8);
        assert!(outbox.is_empty());
    }

    #[test]
    fn oversized_frame_fits_an_empty_buffer() {
        let outbox = OutgoingBuffer::new(16);
        outbox.push(&message(100)).unwrap();
        assert_eq!(outbox.len(), HEADER_SIZE + 100);
    }

    #[test]
    fn full_buffer_blocks_until_taken() {
        let outbox = Arc::new(OutgoingBuffer::new(HEADER_SIZE + 10));
        outbox.push(&message(10)).unwrap();

        let writer = {
            let outbox = Arc::clone(&outbox);
            thread::spawn(move || outbox.push(&message(10)))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!writer.is_finished());

        outbox.take(usize::MAX, Duration::ZERO).unwrap();
        writer.join().unwrap().unwrap();
        assert_eq!(outbox.len(), HEADER_SIZE + 10);
    }

    #[test]
    fn closed_buffer_rejects_and_drains() {
        let outbox = OutgoingBuffer::new(1024);
        outbox.push(&message(1)).unwrap();
        outbox.close();

        assert!(matches!(outbox.push(&message(1)), Err(OutboxError::Closed)));
        assert!(outbox.take(1024, Duration::ZERO).is_some());
        assert!(outbox.take(1024, Duration::ZERO).is_none());
    }
}
