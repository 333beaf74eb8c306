use std::io::{self, Read, Write};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_slice, decode_from_std_read, encode_into_std_write,
};
use thiserror::Error;

use crate::{message::Message, node::NodeId};

/// Message type reserved for frames the transport exchanges with itself.
pub const CONTROL_TYPE: u8 = 0;
/// Control subtype carrying the number of confirmed bytes.
pub const FLOW_CONTROL_SUBTYPE: u8 = 1;

pub const FIXED_HEADER_SIZE: usize = 12;
pub const PAYLOAD_LENGTH_SIZE: usize = 4;
pub const HEADER_SIZE: usize = FIXED_HEADER_SIZE + PAYLOAD_LENGTH_SIZE;

pub fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload of {length} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge { length: usize, max: usize },
    #[error("failed to encode frame: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode frame: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("frame IO error: {0}")]
    Io(#[from] io::Error),
}

/// Leading part of every frame, followed by the payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct FixedHeader {
    pub id: u64,
    pub msg_type: u8,
    pub subtype: u8,
    pub rating: u8,
    pub status: u8,
}

impl FixedHeader {
    pub fn of(message: &Message) -> Self {
        Self {
            id: message.id,
            msg_type: message.msg_type,
            subtype: message.subtype,
            rating: message.rating,
            status: message.status,
        }
    }

    pub fn is_control(&self) -> bool {
        self.msg_type == CONTROL_TYPE
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (header, _) = decode_from_slice(bytes, wire_config())?;
        Ok(header)
    }
}

pub fn decode_payload_length(bytes: &[u8]) -> Result<u32, FrameError> {
    let (length, _) = decode_from_slice(bytes, wire_config())?;
    Ok(length)
}

/// Appends a frame header to `out`.
pub fn encode_header(
    header: &FixedHeader,
    payload_length: usize,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    let length = u32::try_from(payload_length).map_err(|_| FrameError::PayloadTooLarge {
        length: payload_length,
        max: u32::MAX as usize,
    })?;

    encode_into_std_write(header, out, wire_config())?;
    encode_into_std_write(length, out, wire_config())?;
    Ok(())
}

/// Appends the complete frame of `message` to `out`.
pub fn encode_message(message: &Message, out: &mut Vec<u8>) -> Result<(), FrameError> {
    encode_header(&FixedHeader::of(message), message.payload.len(), out)?;
    out.extend_from_slice(&message.payload);
    Ok(())
}

/// Frame telling the sender that `confirmed` more bytes were received.
pub fn flow_control_frame(confirmed: u32) -> Result<Vec<u8>, FrameError> {
    let header = FixedHeader {
        id: 0,
        msg_type: CONTROL_TYPE,
        subtype: FLOW_CONTROL_SUBTYPE,
        rating: 0,
        status: 0,
    };

    let mut out = Vec::with_capacity(HEADER_SIZE + 4);
    encode_header(&header, 4, &mut out)?;
    encode_into_std_write(confirmed, &mut out, wire_config())?;
    Ok(out)
}

pub fn decode_flow_control(payload: &[u8]) -> Result<u32, FrameError> {
    let (confirmed, _) = decode_from_slice(payload, wire_config())?;
    Ok(confirmed)
}

/// First bytes written by the dialing side of a link: its own node id.
pub fn write_handshake<W: Write>(link: &mut W, own: NodeId) -> Result<(), FrameError> {
    encode_into_std_write(own.0, link, wire_config())?;
    link.flush()?;
    Ok(())
}

pub fn read_handshake<R: Read>(link: &mut R) -> Result<NodeId, FrameError> {
    let id: u16 = decode_from_std_read(link, wire_config())?;
    Ok(NodeId(id))
}
