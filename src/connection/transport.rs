use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, info};

use crate::node::{NodeId, NodeMap};

const ACCEPT_POLL: Duration = Duration::from_millis(5);

/// One bidirectional byte stream between two nodes.
pub trait Link: Read + Write + Send {
    /// A second handle on the same stream, for a reader and a writer on different threads.
    fn try_clone_link(&self) -> io::Result<Box<dyn Link>>;

    /// Ends the stream in both directions, waking up blocked readers and writers of every handle.
    fn shutdown(&self);

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn peer(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// TCP sockets.
    Nio,
    /// In-process links, for tests and single-process clusters.
    Loopback,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Nio => f.write_str("nio"),
            TransportKind::Loopback => f.write_str("loopback"),
        }
    }
}

/// Establishes links. Framing, flow control and connection bookkeeping are shared by all
/// transports and live above this trait.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn dial(&self, destination: NodeId, timeout: Duration) -> io::Result<Box<dyn Link>>;

    /// Waits up to `timeout` for the next incoming link.
    fn accept(&self, timeout: Duration) -> io::Result<Option<Box<dyn Link>>>;

    /// Stops accepting. Established links are not affected.
    fn close(&self);
}

pub struct TcpTransport {
    nodes: Arc<dyn NodeMap>,
    listener: TcpListener,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Listens on the address the node map has for its own node.
    pub fn bind(nodes: Arc<dyn NodeMap>) -> io::Result<Self> {
        let own = nodes.own_node_id();
        let address = nodes.address(own).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("node map has no address for own node {own}"),
            )
        })?;
        Self::bind_to(nodes, address)
    }

    pub fn bind_to(nodes: Arc<dyn NodeMap>, address: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        info!("listening at {}", listener.local_addr()?);

        Ok(Self {
            nodes,
            listener,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Nio
    }

    fn dial(&self, destination: NodeId, timeout: Duration) -> io::Result<Box<dyn Link>> {
        let address = self.nodes.address(destination).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address known for {destination}"),
            )
        })?;

        debug!("dialing {destination} at {address}");
        let stream = TcpStream::connect_timeout(&address, timeout)?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpLink { stream }))
    }

    fn accept(&self, timeout: Duration) -> io::Result<Option<Box<dyn Link>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted link from {peer}");
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    return Ok(Some(Box::new(TcpLink { stream })));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct TcpLink {
    stream: TcpStream,
}

impl Read for TcpLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Link for TcpLink {
    fn try_clone_link(&self) -> io::Result<Box<dyn Link>> {
        Ok(Box::new(TcpLink {
            stream: self.stream.try_clone()?,
        }))
    }

    fn shutdown(&self) {
        // fails if the peer is gone already
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    fn peer(&self) -> String {
        self.stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use crate::node::StaticNodeMap;

    use super::*;

    #[test]
    fn dial_and_accept_over_tcp() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpTransport::bind_to(Arc::new(StaticNodeMap::new(NodeId(1))), any).unwrap();
        let address = server.local_addr().unwrap();

        let nodes = StaticNodeMap::new(NodeId(2)).with_node(NodeId(1), address);
        let client = TcpTransport::bind_to(Arc::new(nodes), any).unwrap();

        let mut outgoing = client.dial(NodeId(1), Duration::from_secs(1)).unwrap();
        let mut incoming = server
            .accept(Duration::from_secs(5))
            .unwrap()
            .expect("no incoming link");

        outgoing.write_all(b"ping").unwrap();
        let mut buf = [0; 4];
        incoming.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        outgoing.shutdown();
        assert_eq!(incoming.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn dialing_an_unknown_node_fails() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let transport =
            TcpTransport::bind_to(Arc::new(StaticNodeMap::new(NodeId(1))), any).unwrap();

        let err = transport
            .dial(NodeId(9), Duration::from_millis(100))
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn accept_times_out() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let transport =
            TcpTransport::bind_to(Arc::new(StaticNodeMap::new(NodeId(1))), any).unwrap();
        assert!(transport.accept(Duration::from_millis(20)).unwrap().is_none());
    }
}
