//! Correlation of outstanding requests with their responses.
//!
//! The map is a fixed array of slots addressed by `id % size`. A slot is occupied from
//! [`RequestMap::put`] until the request is fulfilled, removed or cancelled. Two outstanding
//! requests whose ids share a slot collide; the second `put` fails instead of evicting the first.
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use log::{debug, trace, warn};

use crate::{
    config::REQUEST_MAP_WARN_SIZE,
    error::NetworkError,
    message::{Message, PendingRequest},
    node::NodeId,
};

pub struct RequestMap {
    slots: Box<[ArcSwapOption<PendingRequest>]>,
}

impl RequestMap {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        if size <= REQUEST_MAP_WARN_SIZE {
            warn!("request map with {size} slots is small, expect collisions under load");
        }

        Self {
            slots: (0..size).map(|_| ArcSwapOption::empty()).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    fn slot_of(&self, id: u64) -> usize {
        (id % self.slots.len() as u64) as usize
    }

    pub fn put(&self, pending: Arc<PendingRequest>) -> Result<(), NetworkError> {
        let id = pending.id();
        let slot = self.slot_of(id);

        let previous =
            self.slots[slot].compare_and_swap(&None::<Arc<PendingRequest>>, Some(pending));
        if previous.is_some() {
            warn!("request {id} collides with an outstanding request in slot {slot}");
            return Err(NetworkError::RequestSlotInUse { id, slot });
        }

        Ok(())
    }

    /// Hands `response` to the request with the same id and wakes its waiter. Returns false if
    /// no such request is outstanding, e.g. because it timed out already.
    pub fn fulfill(&self, response: Message) -> bool {
        let id = response.id;
        let Some(pending) = self.take(id) else {
            trace!("no outstanding request for response {id} from {}", response.source);
            return false;
        };

        pending.fulfill(response)
    }

    /// Drops the entry of request `id` without waking anyone.
    pub fn remove(&self, id: u64) -> Option<Arc<PendingRequest>> {
        self.take(id)
    }

    /// Cancels every outstanding request to `destination`. Returns how many were cancelled.
    pub fn remove_all(&self, destination: NodeId) -> usize {
        let mut cancelled = 0;
        for slot in self.slots.iter() {
            let Some(pending) = slot.load_full() else {
                continue;
            };
            if pending.destination() != destination {
                continue;
            }

            let previous = slot.compare_and_swap(&pending, None::<Arc<PendingRequest>>);
            let removed = matches!(&*previous, Some(p) if Arc::ptr_eq(p, &pending));
            if removed && pending.cancel() {
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            debug!("cancelled {cancelled} outstanding requests to {destination}");
        }
        cancelled
    }

    pub fn outstanding(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.load().is_some())
            .count()
    }

    fn take(&self, id: u64) -> Option<Arc<PendingRequest>> {
        let slot = &self.slots[self.slot_of(id)];
        let pending = slot.load_full()?;
        if pending.id() != id {
            return None;
        }

        let previous = slot.compare_and_swap(&pending, None::<Arc<PendingRequest>>);
        match &*previous {
            Some(current) if Arc::ptr_eq(current, &pending) => Some(pending),
            _ => None,
        }
    }
}
