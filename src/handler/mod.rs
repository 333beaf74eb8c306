//! Handler threads draining the receive lanes.
//!
//! Two lanes connect the I/O threads with the application:
//!
//! - the default lane, a ring of [`MessageHeader`]s served by `default_handler_threads` workers.
//!   Worker 0 polls the ring continuously. The others sleep until worker 0 sees the ring more
//!   than 90% full and calls for support; a helper then drains the ring to empty and goes back
//!   to sleep. Delivery order is not guaranteed on this lane.
//! - the exclusive lane, a ring of materialized [`Message`]s served by a single worker, so
//!   exclusive messages are delivered one at a time in arrival order.
pub mod backoff;
mod dispatch;
mod intake;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, Thread},
    time::Duration,
};

use log::debug;

use crate::{
    config::{ConfigError, NetworkConfig},
    error::NetworkError,
    message::{Message, MessageRegistry},
    protocol::MessageHeader,
    queue::{Consumer, QueueError, ring_queue},
    worker::{Worker, join_all},
};

use backoff::BackoffPolicy;

pub use dispatch::Dispatcher;
pub use intake::Intake;

/// Upper bound of a sleeping helper's nap, after which it re-checks the shutdown flag.
const HELPER_PARK: Duration = Duration::from_millis(100);

struct Shared {
    running: Arc<AtomicBool>,
    support_requested: AtomicBool,
    dispatcher: Arc<Dispatcher>,
    backoff: BackoffPolicy,
}

pub struct MessageHandlerPool {
    shared: Arc<Shared>,
    intake: Arc<Intake>,
    workers: Vec<Worker>,
    default_lane: Consumer<MessageHeader>,
    shutdown_timeout: Duration,
}

impl MessageHandlerPool {
    pub fn new(
        config: &NetworkConfig,
        registry: Arc<MessageRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, NetworkError> {
        let threads = config.default_handler_threads.max(1);
        let not_power_of_two = |name: &'static str| {
            move |QueueError::Capacity(capacity)| ConfigError::NotPowerOfTwo { name, capacity }
        };

        let (default_tx, default_rx) = ring_queue::<MessageHeader>(config.default_queue_capacity)
            .map_err(not_power_of_two("default_queue"))?;
        let (exclusive_tx, exclusive_rx) = ring_queue::<Message>(config.exclusive_queue_capacity)
            .map_err(not_power_of_two("exclusive_queue"))?;

        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::new(Shared {
            running: Arc::clone(&running),
            support_requested: AtomicBool::new(false),
            dispatcher,
            backoff: config.backoff,
        });

        let intake = Arc::new(Intake::new(
            config.own_node_id,
            registry,
            default_tx,
            exclusive_tx,
            config.backoff,
            running,
        ));

        let mut workers = Vec::with_capacity(threads + 1);
        for id in 1..threads {
            let shared = Arc::clone(&shared);
            let lane = default_rx.clone();
            workers.push(Worker::spawn(format!("nodenet-helper-{id}"), move || {
                run_helper(id, &shared, &lane)
            })?);
        }

        let helpers: Vec<Thread> = workers.iter().map(|w| w.thread().clone()).collect();
        {
            let shared = Arc::clone(&shared);
            let lane = default_rx.clone();
            workers.insert(
                0,
                Worker::spawn("nodenet-poller-0".to_string(), move || {
                    run_poller(&shared, &lane, &helpers)
                })?,
            );
        }

        {
            let shared = Arc::clone(&shared);
            workers.push(Worker::spawn("nodenet-exclusive".to_string(), move || {
                run_exclusive(&shared, &exclusive_rx)
            })?);
        }

        debug!(
            "started {} default handlers and one exclusive handler",
            threads
        );

        Ok(Self {
            shared,
            intake,
            workers,
            default_lane: default_rx,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Producer side for the I/O threads.
    pub fn intake(&self) -> Arc<Intake> {
        Arc::clone(&self.intake)
    }

    pub fn default_lane_len(&self) -> usize {
        self.default_lane.len()
    }

    pub fn support_requested(&self) -> bool {
        self.shared.support_requested.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stops all workers. Waits up to the shutdown timeout for them; stragglers are detached.
    pub fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.dispatcher.stop();

        for worker in &self.workers {
            worker.unpark();
        }
        join_all(self.workers.drain(..), self.shutdown_timeout);
    }
}

impl Drop for MessageHandlerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn under_pressure(lane: &Consumer<MessageHeader>) -> bool {
    lane.len() * 10 > lane.capacity() * 9
}

fn run_poller(shared: &Shared, lane: &Consumer<MessageHeader>, helpers: &[Thread]) {
    let mut backoff = shared.backoff.backoff();

    while shared.running.load(Ordering::Acquire) {
        if !helpers.is_empty()
            && under_pressure(lane)
            && !shared.support_requested.swap(true, Ordering::AcqRel)
        {
            debug!("default lane under pressure, waking {} helpers", helpers.len());
            for helper in helpers {
                helper.unpark();
            }
        }

        match lane.pop() {
            Some(header) => {
                backoff.reset();
                shared.dispatcher.handle_header(header);
            }
            None => backoff.snooze(),
        }
    }
}

fn run_helper(id: usize, shared: &Shared, lane: &Consumer<MessageHeader>) {
    while shared.running.load(Ordering::Acquire) {
        thread::park_timeout(HELPER_PARK);
        if !shared.support_requested.load(Ordering::Acquire) {
            continue;
        }

        let mut handled = 0usize;
        while let Some(header) = lane.pop() {
            shared.dispatcher.handle_header(header);
            handled += 1;
            if !shared.running.load(Ordering::Acquire) {
                return;
            }
        }

        debug!("helper {id} drained the default lane after {handled} messages");
        shared.support_requested.store(false, Ordering::Release);
    }
}

fn run_exclusive(shared: &Shared, lane: &Consumer<Message>) {
    let mut backoff = shared.backoff.backoff();

    while shared.running.load(Ordering::Acquire) {
        match lane.pop() {
            Some(message) => {
                backoff.reset();
                shared.dispatcher.deliver(message);
            }
            None => backoff.snooze(),
        }
    }
}
