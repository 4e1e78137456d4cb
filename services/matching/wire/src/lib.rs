//! Binary codec, packet header and matching payloads for matchnet.
//!
//! Every message exchanged between matchnet peers has the same shape:
//!
//! ```text
//! +----------------------+----------------------------+
//! | i32 packet_id (BE)   | packet type from catalogue |
//! +----------------------+----------------------------+
//! | payload              | fields laid out by codec   |
//! +----------------------+----------------------------+
//! ```
//!
//! All multi-byte primitives are stored big-endian whatever the host order.
//! Text and byte-array fields are fixed-width and zero-padded.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod header;
pub mod packets;
pub mod serializer;

// Re-export main types
pub use config::NetConfig;
pub use error::CodecError;
pub use header::{PacketHeader, PacketId, PACKET_HEADER_SIZE};
pub use packets::{
    EndPointData, MatchingRequest, MatchingRequestId, MatchingResponse, MatchingResult, Packet,
    RoomInfo, SearchRoomResponse, SessionData, IP_ADDRESS_LENGTH, ROOM_NAME_LENGTH,
};
pub use serializer::{Endianness, Primitive, Serializer};
