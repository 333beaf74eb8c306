use std::{mem, sync::Arc};

use crate::{message::Message, node::NodeId, pool::Pooled};

use super::frame::{
    FIXED_HEADER_SIZE, FixedHeader, FrameError, HEADER_SIZE, PAYLOAD_LENGTH_SIZE,
    decode_payload_length,
};

/// One network read in a pooled buffer. Frames borrow ranges of it until the last one is
/// materialized, then the buffer goes back to its pool.
#[derive(Debug)]
pub struct ReceiveBuffer {
    data: Pooled<Vec<u8>>,
    len: usize,
}

impl ReceiveBuffer {
    pub fn new(data: Pooled<Vec<u8>>, len: usize) -> Self {
        let len = len.min(data.len());
        Self { data, len }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Payload of a decoded frame.
#[derive(Debug)]
pub enum PayloadRef {
    /// Entirely contained in a single read.
    Pooled {
        buffer: Arc<ReceiveBuffer>,
        start: usize,
        end: usize,
    },
    /// Assembled from several reads.
    Owned(Vec<u8>),
}

impl PayloadRef {
    pub fn bytes(&self) -> &[u8] {
        match self {
            PayloadRef::Pooled { buffer, start, end } => {
                buffer.bytes().get(*start..*end).unwrap_or_default()
            }
            PayloadRef::Owned(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_vec(self) -> Vec<u8> {
        match self {
            PayloadRef::Owned(bytes) => bytes,
            pooled => pooled.bytes().to_vec(),
        }
    }
}

#[derive(Debug)]
pub struct Frame {
    pub header: FixedHeader,
    pub payload: PayloadRef,
}

/// A received frame that still references the receive buffer. Built on the I/O thread and turned
/// into a [`Message`] by whichever worker picks it up.
#[derive(Debug)]
pub struct MessageHeader {
    pub header: FixedHeader,
    pub source: NodeId,
    pub payload: PayloadRef,
}

impl MessageHeader {
    pub fn new(frame: Frame, source: NodeId) -> Self {
        Self {
            header: frame.header,
            source,
            payload: frame.payload,
        }
    }

    /// Copies the payload out and releases the receive buffer reference.
    pub fn materialize(self, destination: NodeId) -> Message {
        Message {
            id: self.header.id,
            source: self.source,
            destination,
            msg_type: self.header.msg_type,
            subtype: self.header.subtype,
            status: self.header.status,
            rating: self.header.rating,
            payload: self.payload.into_vec(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadFixedHeader,
    ReadPayloadLength,
    ReadPayload,
}

/// Incremental frame parser of one incoming pipe.
///
/// Bytes may arrive split at any position. The decoder keeps the partially read header or
/// payload between calls and resumes at the exact byte it stopped at.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    max_payload_size: usize,
    scratch: [u8; HEADER_SIZE],
    filled: usize,
    header: Option<FixedHeader>,
    payload_length: usize,
    spill: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            state: State::ReadFixedHeader,
            max_payload_size,
            scratch: [0; HEADER_SIZE],
            filled: 0,
            header: None,
            payload_length: 0,
            spill: Vec::new(),
        }
    }

    /// True between frames.
    pub fn is_idle(&self) -> bool {
        self.state == State::ReadFixedHeader && self.filled == 0
    }

    pub fn reset(&mut self) {
        self.state = State::ReadFixedHeader;
        self.filled = 0;
        self.header = None;
        self.payload_length = 0;
        self.spill = Vec::new();
    }

    /// Parses every byte of `buffer`, appending completed frames to `frames`.
    ///
    /// On error the decoder is reset and the remaining bytes of `buffer` are discarded; frames
    /// completed before the error stay in `frames`.
    pub fn decode(
        &mut self,
        buffer: &Arc<ReceiveBuffer>,
        frames: &mut Vec<Frame>,
    ) -> Result<(), FrameError> {
        let result = self.decode_inner(buffer, frames);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn decode_inner(
        &mut self,
        buffer: &Arc<ReceiveBuffer>,
        frames: &mut Vec<Frame>,
    ) -> Result<(), FrameError> {
        let bytes = buffer.bytes();
        let mut pos = 0;

        while pos < bytes.len() {
            match self.state {
                State::ReadFixedHeader => {
                    pos += self.fill(&bytes[pos..], FIXED_HEADER_SIZE);
                    if self.filled == FIXED_HEADER_SIZE {
                        let header = FixedHeader::decode(&self.scratch[..FIXED_HEADER_SIZE])?;
                        self.header = Some(header);
                        self.filled = 0;
                        self.state = State::ReadPayloadLength;
                    }
                }
                State::ReadPayloadLength => {
                    pos += self.fill(&bytes[pos..], PAYLOAD_LENGTH_SIZE);
                    if self.filled == PAYLOAD_LENGTH_SIZE {
                        let length = decode_payload_length(&self.scratch[..PAYLOAD_LENGTH_SIZE])?
                            as usize;
                        if length > self.max_payload_size {
                            return Err(FrameError::PayloadTooLarge {
                                length,
                                max: self.max_payload_size,
                            });
                        }

                        self.filled = 0;
                        self.payload_length = length;
                        if length == 0 {
                            self.complete(PayloadRef::Owned(Vec::new()), frames);
                        } else {
                            self.state = State::ReadPayload;
                        }
                    }
                }
                State::ReadPayload => {
                    let missing = self.payload_length - self.spill.len();
                    let available = bytes.len() - pos;

                    if self.spill.is_empty() && available >= missing {
                        let payload = PayloadRef::Pooled {
                            buffer: Arc::clone(buffer),
                            start: pos,
                            end: pos + missing,
                        };
                        pos += missing;
                        self.complete(payload, frames);
                    } else {
                        let take = missing.min(available);
                        if self.spill.is_empty() {
                            self.spill.reserve_exact(self.payload_length);
                        }
                        self.spill.extend_from_slice(&bytes[pos..pos + take]);
                        pos += take;

                        if self.spill.len() == self.payload_length {
                            let payload = PayloadRef::Owned(mem::take(&mut self.spill));
                            self.complete(payload, frames);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn fill(&mut self, input: &[u8], want: usize) -> usize {
        let take = (want - self.filled).min(input.len());
        self.scratch[self.filled..self.filled + take].copy_from_slice(&input[..take]);
        self.filled += take;
        take
    }

    fn complete(&mut self, payload: PayloadRef, frames: &mut Vec<Frame>) {
        if let Some(header) = self.header.take() {
            frames.push(Frame { header, payload });
        }
        self.state = State::ReadFixedHeader;
        self.filled = 0;
        self.payload_length = 0;
    }
}

#[cfg(test)]
mod tests {
    use crate::{pool::Pool, protocol::frame::encode_message};

    use super::*;

    fn pool() -> Pool<Vec<u8>> {
        Pool::new(4, || vec![0; 128 * 1024], |_| {})
    }

    fn read(pool: &Pool<Vec<u8>>, bytes: &[u8]) -> Arc<ReceiveBuffer> {
        let mut data = pool.checkout();
        data[..bytes.len()].copy_from_slice(bytes);
        Arc::new(ReceiveBuffer::new(data, bytes.len()))
    }

    fn message(id: u64, payload: Vec<u8>) -> Message {
        let mut message = Message::new(NodeId(2), 9, id as u8)
            .with_payload(payload)
            .with_status(0x80 | id as u8)
            .with_rating((id as u8).wrapping_add(3));
        message.id = id;
        message
    }

    fn assert_same(got: &Message, want: &Message) {
        assert_eq!(
            (got.id, got.msg_type, got.subtype, got.rating, got.status),
            (want.id, want.msg_type, want.subtype, want.rating, want.status)
        );
        assert_eq!(got.payload, want.payload);
    }

    fn encode(messages: &[Message]) -> Vec<u8> {
        let mut out = Vec::new();
        for message in messages {
            encode_message(message, &mut out).unwrap();
        }
        out
    }

    fn materialize(frames: Vec<Frame>) -> Vec<Message> {
        frames
            .into_iter()
            .map(|frame| MessageHeader::new(frame, NodeId(1)).materialize(NodeId(2)))
            .collect()
    }

    #[test]
    fn round_trip_payload_sizes() {
        let pool = pool();
        for size in [0, 1, 65536] {
            let sent = message(size as u64 + 1, (0..size).map(|i| i as u8).collect());
            let mut decoder = FrameDecoder::new(1 << 20);
            let mut frames = Vec::new();

            decoder
                .decode(&read(&pool, &encode(&[sent.clone()])), &mut frames)
                .unwrap();

            let received = materialize(frames);
            assert_eq!(received.len(), 1);
            assert_same(&received[0], &sent);
            assert_eq!(received[0].source, NodeId(1));
            assert!(decoder.is_idle());
        }
    }

    #[test]
    fn several_frames_in_one_read() {
        let pool = pool();
        let sent: Vec<_> = (1..=5).map(|i| message(i, vec![i as u8; i as usize])).collect();

        let mut decoder = FrameDecoder::new(1024);
        let mut frames = Vec::new();
        decoder
            .decode(&read(&pool, &encode(&sent)), &mut frames)
            .unwrap();

        // whole payloads reference the receive buffer
        assert!(
            frames
                .iter()
                .all(|f| matches!(f.payload, PayloadRef::Pooled { .. }))
        );

        let ids: Vec<_> = materialize(frames).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn frames_straddling_reads() {
        let pool = pool();
        let sent = vec![
            message(1, vec![7; 300]),
            message(2, Vec::new()),
            message(3, vec![8; 50]),
        ];
        let bytes = encode(&sent);

        for chunk in [1, 3, 7, 13, 16, 17, 100] {
            let mut decoder = FrameDecoder::new(1024);
            let mut frames = Vec::new();
            for part in bytes.chunks(chunk) {
                decoder.decode(&read(&pool, part), &mut frames).unwrap();
            }

            let received = materialize(frames);
            assert_eq!(received.len(), 3, "chunk size {chunk}");
            for (got, want) in received.iter().zip(&sent) {
                assert_same(got, want);
            }
        }
    }

    #[test]
    fn oversized_payload_resets_the_decoder() {
        let pool = pool();
        let good = message(1, vec![1; 4]);
        let big = message(2, vec![2; 64]);

        let mut bytes = encode(&[good.clone(), big]);
        let mut decoder = FrameDecoder::new(16);
        let mut frames = Vec::new();

        let result = decoder.decode(&read(&pool, &bytes), &mut frames);
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { length: 64, max: 16 })
        ));
        // the frame before the bad one is kept
        assert_eq!(frames.len(), 1);
        assert!(decoder.is_idle());

        bytes = encode(&[good]);
        decoder.decode(&read(&pool, &bytes), &mut frames).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn receive_buffer_returns_after_last_payload() {
        let pool = pool();
        let mut decoder = FrameDecoder::new(1024);
        let mut frames = Vec::new();

        decoder
            .decode(
                &read(&pool, &encode(&[message(1, vec![1, 2, 3])])),
                &mut frames,
            )
            .unwrap();
        assert_eq!(pool.idle(), 3);

        drop(materialize(frames));
        assert_eq!(pool.idle(), 4);
    }
}
