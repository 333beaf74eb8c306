use std::{
    collections::{HashMap, VecDeque},
    io::{self, Read, Write},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::debug;

use crate::node::NodeId;

use super::transport::{Link, Transport, TransportKind};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct PipeState {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// One direction of a memory link.
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    fn close(&self) {
        lock(&self.state).closed = true;
        self.readable.notify_all();
    }
}

/// In-memory duplex stream.
pub struct MemoryLink {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    read_timeout: Arc<Mutex<Option<Duration>>>,
    name: String,
}

impl MemoryLink {
    /// Two connected ends.
    pub fn pair(a: NodeId, b: NodeId) -> (MemoryLink, MemoryLink) {
        let ab = Arc::new(Pipe::default());
        let ba = Arc::new(Pipe::default());
        (
            MemoryLink {
                rx: Arc::clone(&ba),
                tx: Arc::clone(&ab),
                read_timeout: Arc::default(),
                name: format!("memory:{b}"),
            },
            MemoryLink {
                rx: ab,
                tx: ba,
                read_timeout: Arc::default(),
                name: format!("memory:{a}"),
            },
        )
    }
}

impl Read for MemoryLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let timeout = *lock(&self.read_timeout);
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&self.rx.state);

        while state.bytes.is_empty() && !state.closed {
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "memory link read timed out",
                        ));
                    }
                    self.rx
                        .readable
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .rx
                    .readable
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }

        let count = buf.len().min(state.bytes.len());
        for (dst, src) in buf.iter_mut().zip(state.bytes.drain(..count)) {
            *dst = src;
        }
        Ok(count)
    }
}

impl Write for MemoryLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.tx.state);
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory link closed",
            ));
        }
        state.bytes.extend(buf);
        self.tx.readable.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for MemoryLink {
    fn try_clone_link(&self) -> io::Result<Box<dyn Link>> {
        Ok(Box::new(MemoryLink {
            rx: Arc::clone(&self.rx),
            tx: Arc::clone(&self.tx),
            read_timeout: Arc::clone(&self.read_timeout),
            name: self.name.clone(),
        }))
    }

    fn shutdown(&self) {
        self.rx.close();
        self.tx.close();
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        *lock(&self.read_timeout) = timeout;
        Ok(())
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

#[derive(Default)]
struct BacklogState {
    links: VecDeque<MemoryLink>,
    closed: bool,
}

#[derive(Default)]
struct Backlog {
    state: Mutex<BacklogState>,
    ready: Condvar,
}

/// Switchboard of an in-process cluster. Every [`LoopbackTransport`] created from the same hub
/// can dial every other one.
#[derive(Default)]
pub struct LoopbackHub {
    nodes: Mutex<HashMap<NodeId, Arc<Backlog>>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `own` with the hub. A node that is already registered is replaced.
    pub fn transport(self: &Arc<Self>, own: NodeId) -> LoopbackTransport {
        let backlog = Arc::new(Backlog::default());
        lock(&self.nodes).insert(own, Arc::clone(&backlog));
        LoopbackTransport {
            hub: Arc::clone(self),
            own,
            backlog,
        }
    }
}

pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    own: NodeId,
    backlog: Arc<Backlog>,
}

impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Loopback
    }

    fn dial(&self, destination: NodeId, _timeout: Duration) -> io::Result<Box<dyn Link>> {
        let backlog = lock(&self.hub.nodes).get(&destination).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{destination} is not on the hub"),
            )
        })?;

        let (local, remote) = MemoryLink::pair(self.own, destination);
        let mut state = lock(&backlog.state);
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{destination} stopped accepting"),
            ));
        }
        state.links.push_back(remote);
        backlog.ready.notify_one();

        debug!("{} dialed {destination} over loopback", self.own);
        Ok(Box::new(local))
    }

    fn accept(&self, timeout: Duration) -> io::Result<Option<Box<dyn Link>>> {
        let state = lock(&self.backlog.state);
        let (mut state, _) = self
            .backlog
            .ready
            .wait_timeout_while(state, timeout, |s| s.links.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        Ok(state
            .links
            .pop_front()
            .map(|link| Box::new(link) as Box<dyn Link>))
    }

    fn close(&self) {
        let mut nodes = lock(&self.hub.nodes);
        if nodes
            .get(&self.own)
            .is_some_and(|backlog| Arc::ptr_eq(backlog, &self.backlog))
        {
            nodes.remove(&self.own);
        }
        drop(nodes);

        let mut state = lock(&self.backlog.state);
        state.closed = true;
        for link in state.links.drain(..) {
            link.shutdown();
        }
        self.backlog.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn memory_link_is_duplex() {
        let (mut a, mut b) = MemoryLink::pair(NodeId(1), NodeId(2));
        a.write_all(b"hello").unwrap();
        b.write_all(b"world").unwrap();

        let mut buf = [0; 5];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn shutdown_wakes_a_blocked_reader() {
        let (a, mut b) = MemoryLink::pair(NodeId(1), NodeId(2));
        let reader = thread::spawn(move || {
            let mut buf = [0; 8];
            b.read(&mut buf).unwrap()
        });

        thread::sleep(Duration::from_millis(20));
        a.shutdown();
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn read_timeout() {
        let (_a, mut b) = MemoryLink::pair(NodeId(1), NodeId(2));
        b.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        let mut buf = [0; 1];
        assert_eq!(
            b.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
    }

    #[test]
    fn hub_connects_transports() {
        let hub = LoopbackHub::new();
        let one = hub.transport(NodeId(1));
        let two = hub.transport(NodeId(2));

        let mut outgoing = one.dial(NodeId(2), Duration::ZERO).unwrap();
        let mut incoming = two.accept(Duration::from_secs(1)).unwrap().unwrap();

        outgoing.write_all(&[7]).unwrap();
        let mut buf = [0; 1];
        incoming.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [7]);

        two.close();
        assert_eq!(
            one.dial(NodeId(2), Duration::ZERO).err().unwrap().kind(),
            io::ErrorKind::ConnectionRefused
        );
    }
}
