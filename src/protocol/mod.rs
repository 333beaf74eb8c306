//! Node-to-node wire protocol.
//!
//! Every message travels as one frame: a 16 byte header followed by the payload.
//!
//! # Binary Format
//!
//! ```text
//! id: u64 | type: u8 | subtype: u8 | rating: u8 | status: u8 | payload_length: u32 | payload
//! ```
//!
//! All integers are big-endian and fixed width, produced by bincode with
//! [`wire_config`]. The first twelve bytes form the [`FixedHeader`]; the length is parsed as a
//! separate step so the [`FrameDecoder`] can validate it before committing to a payload.
//!
//! Message type `0` is reserved for control frames. The only control frame today is the flow
//! control confirmation (subtype `1`) whose payload is the `u32` number of bytes the receiver
//! consumed since its previous confirmation. Control frames never reach application receivers.
//!
//! A dialed link starts with a handshake: the dialer writes its own node id as a big-endian
//! `u16` before the first frame.
mod decoder;
mod frame;

pub use decoder::{Frame, FrameDecoder, MessageHeader, PayloadRef, ReceiveBuffer};
pub use frame::{
    CONTROL_TYPE, FIXED_HEADER_SIZE, FLOW_CONTROL_SUBTYPE, FixedHeader, FrameError, HEADER_SIZE,
    decode_flow_control, encode_header, encode_message, flow_control_frame, read_handshake,
    wire_config, write_handshake,
};
