use std::{
    io,
    thread::{self, JoinHandle, Thread},
    time::{Duration, Instant},
};

use log::{debug, error, warn};

const JOIN_POLL: Duration = Duration::from_millis(1);

/// A named thread owned by one of the engine's components.
#[derive(Debug)]
pub struct Worker {
    name: String,
    thread: JoinHandle<()>,
}

impl Worker {
    pub fn spawn<F>(name: String, f: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = thread::Builder::new().name(name.clone()).spawn(f)?;
        Ok(Self { name, thread })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread(&self) -> &Thread {
        self.thread.thread()
    }

    pub fn unpark(&self) {
        self.thread.thread().unpark();
    }

    pub fn is_current(&self) -> bool {
        self.thread.thread().id() == thread::current().id()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Joins `workers`, giving all of them together at most `timeout` to finish.
///
/// Workers are unparked while waiting so parked threads notice a shutdown flag. The calling
/// thread is never joined, and a worker that is still running at the deadline is logged and
/// detached. Returns the number of detached workers.
pub fn join_all(workers: impl IntoIterator<Item = Worker>, timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    let mut detached = 0;

    for worker in workers {
        if worker.is_current() {
            continue;
        }

        while !worker.is_finished() && Instant::now() < deadline {
            worker.unpark();
            thread::sleep(JOIN_POLL);
        }

        if !worker.is_finished() {
            warn!("thread {} did not stop in time, detaching it", worker.name);
            detached += 1;
            continue;
        }

        debug!("shutting down thread {}", worker.name);
        if worker.thread.join().is_err() {
            error!("thread {} panicked", worker.name);
        }
    }

    detached
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[test]
    fn parked_workers_are_woken_and_joined() {
        let stop = Arc::new(AtomicBool::new(false));
        let workers: Vec<_> = (0..3)
            .map(|i| {
                let stop = Arc::clone(&stop);
                Worker::spawn(format!("test-{i}"), move || {
                    while !stop.load(Ordering::Acquire) {
                        thread::park();
                    }
                })
                .unwrap()
            })
            .collect();

        stop.store(true, Ordering::Release);
        assert_eq!(join_all(workers, Duration::from_secs(5)), 0);
    }

    #[test]
    fn stragglers_are_detached() {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = Arc::clone(&stop);
            Worker::spawn("test-straggler".to_string(), move || {
                while !stop.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap()
        };

        assert_eq!(join_all([worker], Duration::from_millis(20)), 1);
        stop.store(true, Ordering::Release);
    }
}
