use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use log::{trace, warn};

use crate::{
    connection::FrameSink,
    message::{Message, MessageRegistry},
    node::NodeId,
    protocol::{Frame, MessageHeader},
    queue::{Full, Producer},
};

use super::backoff::BackoffPolicy;

/// Entry of the receive path used by the I/O threads.
///
/// Sorts decoded frames into the two lanes. Default-lane frames are queued as headers and
/// materialized later by a handler; exclusive-lane frames are materialized right here so the
/// single exclusive handler only delivers. Pushes into a full lane are retried with backoff until
/// the pool shuts down; nothing is dropped while it runs.
pub struct Intake {
    own: NodeId,
    registry: Arc<MessageRegistry>,
    default: Mutex<Producer<MessageHeader>>,
    exclusive: Mutex<Producer<Message>>,
    backoff: BackoffPolicy,
    running: Arc<AtomicBool>,
}

impl Intake {
    pub(super) fn new(
        own: NodeId,
        registry: Arc<MessageRegistry>,
        default: Producer<MessageHeader>,
        exclusive: Producer<Message>,
        backoff: BackoffPolicy,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            own,
            registry,
            default: Mutex::new(default),
            exclusive: Mutex::new(exclusive),
            backoff,
            running,
        }
    }

    /// Queues the frames of one network read received from `source`.
    pub fn accept(&self, source: NodeId, frames: Vec<Frame>) {
        let mut batch = Vec::with_capacity(frames.len());

        for frame in frames {
            let (msg_type, subtype) = (frame.header.msg_type, frame.header.subtype);
            let Some(constructor) = self.registry.lookup(msg_type, subtype) else {
                warn!(
                    "dropping message {} of unknown type ({msg_type}, {subtype}) from {source}",
                    frame.header.id
                );
                continue;
            };

            let header = MessageHeader::new(frame, source);
            if !constructor.is_exclusive() {
                batch.push(header);
                continue;
            }

            match constructor.construct(header.materialize(self.own)) {
                Ok(message) => self.push_exclusive(message),
                Err(e) => warn!(
                    "dropping invalid message ({msg_type}, {subtype}) from {source}: {e}"
                ),
            }
        }

        self.push_default(batch);
    }

    fn push_default(&self, mut batch: Vec<MessageHeader>) {
        if batch.is_empty() {
            return;
        }

        let mut producer = self.default.lock().unwrap_or_else(PoisonError::into_inner);
        let mut backoff = self.backoff.backoff();

        if batch.len() <= producer.capacity() {
            while producer.push_batch(&mut batch).is_err() {
                if !self.running.load(Ordering::Acquire) {
                    warn!("handler pool stopped, dropping {} messages", batch.len());
                    return;
                }
                backoff.snooze();
            }
            return;
        }

        trace!("batch of {} exceeds the default lane, queueing one by one", batch.len());
        for header in batch {
            let mut item = header;
            loop {
                match producer.push(item) {
                    Ok(()) => break,
                    Err(Full(rejected)) => {
                        if !self.running.load(Ordering::Acquire) {
                            warn!("handler pool stopped, dropping message {}", rejected.header.id);
                            return;
                        }
                        item = rejected;
                        backoff.snooze();
                    }
                }
            }
            backoff.reset();
        }
    }

    fn push_exclusive(&self, message: Message) {
        let mut producer = self.exclusive.lock().unwrap_or_else(PoisonError::into_inner);
        let mut backoff = self.backoff.backoff();
        let mut item = message;

        while let Err(Full(rejected)) = producer.push(item) {
            if !self.running.load(Ordering::Acquire) {
                warn!("handler pool stopped, dropping exclusive message {}", rejected.id);
                return;
            }
            item = rejected;
            backoff.snooze();
        }
    }
}

impl FrameSink for Intake {
    fn accept(&self, source: NodeId, frames: Vec<Frame>) {
        Intake::accept(self, source, frames);
    }
}
