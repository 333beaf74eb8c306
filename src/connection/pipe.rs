use std::{
    io::{self, ErrorKind, Read, Write},
    sync::Arc,
    time::Duration,
};

use log::{trace, warn};

use crate::{
    node::NodeId,
    pool::Pool,
    protocol::{
        FLOW_CONTROL_SUBTYPE, Frame, FrameDecoder, ReceiveBuffer, decode_flow_control,
        flow_control_frame,
    },
};

use super::{Connection, flow::ReceiveWindow, transport::Link};

/// Largest chunk handed to a single link write.
const WRITE_CHUNK: usize = 256 * 1024;
/// How long the writer waits for data before re-checking whether the connection closed.
const WRITER_IDLE: Duration = Duration::from_millis(100);
/// Control frames carry a single counter.
const CONTROL_PAYLOAD_MAX: usize = 64;

/// Receiving end of an accepted link.
///
/// Besides decoding, an incoming pipe counts the bytes it consumed and confirms them to the
/// sender on the same link once enough accumulated.
pub struct IncomingPipe {
    source: NodeId,
    link: Box<dyn Link>,
    decoder: FrameDecoder,
    buffers: Pool<Vec<u8>>,
    window: ReceiveWindow,
}

impl IncomingPipe {
    pub fn new(
        source: NodeId,
        link: Box<dyn Link>,
        buffers: Pool<Vec<u8>>,
        max_payload_size: usize,
        flow_control_window: usize,
    ) -> Self {
        Self {
            source,
            link,
            decoder: FrameDecoder::new(max_payload_size),
            buffers,
            window: ReceiveWindow::new(flow_control_window),
        }
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    /// Performs one network read and returns the frames it completed, or `None` once the peer
    /// closed the link.
    pub fn read(&mut self) -> io::Result<Option<Vec<Frame>>> {
        let mut data = self.buffers.checkout();
        let read = loop {
            match self.link.read(&mut data[..]) {
                Ok(0) => return Ok(None),
                Ok(read) => break read,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        let buffer = Arc::new(ReceiveBuffer::new(data, read));
        let mut frames = Vec::new();
        if let Err(e) = self.decoder.decode(&buffer, &mut frames) {
            warn!(
                "dropping the rest of a {read} byte read from {}: {e}",
                self.source
            );
        }

        frames.retain(|frame| {
            if frame.header.is_control() {
                warn!("unexpected control frame on incoming pipe from {}", self.source);
                return false;
            }
            true
        });

        if let Some(confirmed) = self.window.data_received(read) {
            trace!("confirming {confirmed} bytes to {}", self.source);
            let frame = flow_control_frame(confirmed).map_err(io::Error::other)?;
            self.link.write_all(&frame)?;
        }

        Ok(Some(frames))
    }
}

pub(super) fn run_incoming(connection: Arc<Connection>, mut pipe: IncomingPipe) {
    let sink = Arc::clone(&connection.context.sink);
    loop {
        match pipe.read() {
            Ok(Some(frames)) => {
                connection.touch();
                if !frames.is_empty() {
                    sink.accept(pipe.source(), frames);
                }
            }
            Ok(None) => {
                connection.report_lost("closed by peer");
                return;
            }
            Err(e) => {
                connection.report_lost(&format!("read failed: {e}"));
                return;
            }
        }
    }
}

pub(super) fn run_writer(connection: Arc<Connection>, mut link: Box<dyn Link>) {
    loop {
        let Some(chunk) = connection.outbox.take(WRITE_CHUNK, WRITER_IDLE) else {
            return;
        };
        if chunk.is_empty() {
            continue;
        }

        if !connection.flow.wait_for_credit() {
            return;
        }

        if let Err(e) = link.write_all(&chunk).and_then(|_| link.flush()) {
            connection.report_lost(&format!("write failed: {e}"));
            return;
        }
        connection.flow.data_sent(chunk.len());
        connection.touch();
    }
}

/// Reads the confirmations the peer sends back on an outgoing link.
pub(super) fn run_credit_reader(connection: Arc<Connection>, mut link: Box<dyn Link>) {
    let buffers = connection.context.buffers.clone();
    let mut decoder = FrameDecoder::new(CONTROL_PAYLOAD_MAX);
    let mut frames = Vec::new();

    loop {
        let mut data = buffers.checkout();
        let read = match link.read(&mut data[..]) {
            Ok(0) => {
                connection.report_lost("closed by peer");
                return;
            }
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                connection.report_lost(&format!("read failed: {e}"));
                return;
            }
        };

        let buffer = Arc::new(ReceiveBuffer::new(data, read));
        if let Err(e) = decoder.decode(&buffer, &mut frames) {
            warn!("invalid control data from {}: {e}", connection.destination);
        }

        for frame in frames.drain(..) {
            if !frame.header.is_control() || frame.header.subtype != FLOW_CONTROL_SUBTYPE {
                warn!(
                    "unexpected frame ({}, {}) on outgoing pipe to {}",
                    frame.header.msg_type, frame.header.subtype, connection.destination
                );
                continue;
            }

            match decode_flow_control(frame.payload.bytes()) {
                Ok(confirmed) => connection.flow.confirm(confirmed),
                Err(e) => warn!("invalid flow control frame from {}: {e}", connection.destination),
            }
        }
    }
}
