use std::{hint, thread, time::Duration};

/// Thresholds of the escalating wait used by polling threads.
///
/// A poller first busy-spins, then yields its time slice, then sleeps with a doubling duration
/// capped at `max_sleep`. It never parks indefinitely, so a shutdown flag is always re-checked
/// within `max_sleep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub spin_limit: u32,
    pub yield_limit: u32,
    pub min_sleep: Duration,
    pub max_sleep: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            spin_limit: 128,
            yield_limit: 1024,
            min_sleep: Duration::from_micros(50),
            max_sleep: Duration::from_millis(1),
        }
    }
}

impl BackoffPolicy {
    /// A policy that goes to sleep right away. Useful for tests and idle nodes.
    pub fn sleepy(sleep: Duration) -> Self {
        Self {
            spin_limit: 0,
            yield_limit: 0,
            min_sleep: sleep,
            max_sleep: sleep,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(*self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPhase {
    Spin,
    Yield,
    Sleep(Duration),
}

/// Per-thread state of a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    step: u32,
    sleep: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            step: 0,
            sleep: policy.min_sleep,
        }
    }

    /// The phase the next call to [`Backoff::snooze`] will be in.
    pub fn phase(&self) -> BackoffPhase {
        if self.step < self.policy.spin_limit {
            BackoffPhase::Spin
        } else if self.step < self.policy.spin_limit.saturating_add(self.policy.yield_limit) {
            BackoffPhase::Yield
        } else {
            BackoffPhase::Sleep(self.sleep)
        }
    }

    /// Advances the policy by one step and returns the phase that was executed.
    pub fn advance(&mut self) -> BackoffPhase {
        let phase = self.phase();
        match phase {
            BackoffPhase::Sleep(_) => {
                self.sleep = (self.sleep * 2).min(self.policy.max_sleep);
            }
            _ => self.step = self.step.saturating_add(1),
        }
        phase
    }

    /// Waits according to the current phase.
    pub fn snooze(&mut self) {
        match self.advance() {
            BackoffPhase::Spin => hint::spin_loop(),
            BackoffPhase::Yield => thread::yield_now(),
            BackoffPhase::Sleep(duration) => thread::sleep(duration),
        }
    }

    /// Back to the cheapest phase; called whenever work was found.
    pub fn reset(&mut self) {
        self.step = 0;
        self.sleep = self.policy.min_sleep;
    }
}
