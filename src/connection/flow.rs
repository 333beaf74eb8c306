use std::{
    sync::{Condvar, Mutex, PoisonError},
    time::Duration,
};

use log::trace;

/// Longest single wait for credit; the closed flag is re-checked after each.
const CREDIT_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct SendState {
    unconfirmed: u64,
    closed: bool,
}

/// Sender side of the flow control window of one connection.
///
/// The writer may have at most `window` bytes in flight that the receiver has not confirmed.
/// A window of zero disables flow control.
#[derive(Debug)]
pub struct FlowControl {
    window: u64,
    state: Mutex<SendState>,
    credit: Condvar,
}

impl FlowControl {
    pub fn new(window: usize) -> Self {
        Self {
            window: window as u64,
            state: Mutex::new(SendState::default()),
            credit: Condvar::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.window > 0
    }

    /// Blocks while the window is exhausted. Returns false once the connection is closed.
    pub fn wait_for_credit(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while !state.closed && self.window > 0 && state.unconfirmed >= self.window {
            trace!("flow control window of {} bytes exhausted", self.window);
            state = self
                .credit
                .wait_timeout(state, CREDIT_WAIT)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        !state.closed
    }

    pub fn data_sent(&self, bytes: usize) {
        if self.window == 0 {
            return;
        }
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unconfirmed += bytes as u64;
    }

    /// Applies a confirmation from the receiver and wakes the writer.
    pub fn confirm(&self, bytes: u32) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.unconfirmed = state.unconfirmed.saturating_sub(u64::from(bytes));
        self.credit.notify_all();
    }

    pub fn unconfirmed(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unconfirmed
    }

    pub fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.credit.notify_all();
    }
}

/// Receiver side of the window, one per incoming pipe.
#[derive(Debug)]
pub struct ReceiveWindow {
    threshold: u64,
    unconfirmed: u64,
}

impl ReceiveWindow {
    pub fn new(window: usize) -> Self {
        let threshold = match window {
            0 => 0,
            window => (window as u64 / 8).max(1),
        };
        Self {
            threshold,
            unconfirmed: 0,
        }
    }

    /// Counts `bytes` received and returns the amount to confirm once a confirmation is due.
    pub fn data_received(&mut self, bytes: usize) -> Option<u32> {
        if self.threshold == 0 {
            return None;
        }

        self.unconfirmed += bytes as u64;
        if self.unconfirmed < self.threshold {
            return None;
        }

        let confirmed = self.unconfirmed.min(u64::from(u32::MAX));
        self.unconfirmed -= confirmed;
        Some(confirmed as u32)
    }
}
