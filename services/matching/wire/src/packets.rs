//! Matching-service payload records and their codecs.
//!
//! Each record implements [`Packet`], which ties it to a [`PacketId`] and
//! lays its fields out with the [`Serializer`]. Text fields are fixed-width.

use crate::error::CodecError;
use crate::header::{PacketHeader, PacketId};
use crate::serializer::Serializer;
use bytes::Bytes;

/// Width of room name fields
pub const ROOM_NAME_LENGTH: usize = 32;

/// Width of textual IP address fields
pub const IP_ADDRESS_LENGTH: usize = 32;

/// Payload record with a fixed packet type
pub trait Packet: Sized {
    /// Packet type written in the header
    const ID: PacketId;

    /// Append the payload fields
    fn encode(&self, serializer: &mut Serializer);

    /// Read the payload fields from the serializer cursor
    fn decode(serializer: &mut Serializer) -> Result<Self, CodecError>;

    /// Encode the payload without a header
    fn to_bytes(&self) -> Bytes {
        let mut serializer = Serializer::new();
        self.encode(&mut serializer);
        serializer.into_bytes()
    }

    /// Encode header and payload as one message
    fn to_frame(&self) -> Bytes {
        let mut serializer = Serializer::new();
        PacketHeader::new(Self::ID).encode(&mut serializer);
        self.encode(&mut serializer);
        serializer.into_bytes()
    }

    /// Decode a payload that has already been stripped of its header
    fn from_bytes(payload: &[u8]) -> Result<Self, CodecError> {
        let mut serializer = Serializer::from_bytes(payload);
        Self::decode(&mut serializer)
    }
}

/// Kind of matching request
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchingRequestId {
    /// Create a new room
    CreateRoom = 0,
    /// Join an existing room
    JoinRoom = 1,
    /// Start the game session for a room
    StartSession = 2,
    /// List open rooms
    SearchRoom = 3,
}

impl TryFrom<i32> for MatchingRequestId {
    type Error = CodecError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MatchingRequestId::CreateRoom),
            1 => Ok(MatchingRequestId::JoinRoom),
            2 => Ok(MatchingRequestId::StartSession),
            3 => Ok(MatchingRequestId::SearchRoom),
            _ => Err(CodecError::UnknownValue {
                field: "matching request",
                value,
            }),
        }
    }
}

/// Outcome of a matching request
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchingResult {
    /// Request accepted
    Success = 0,
    /// No more rooms can be created
    RoomIsFull = 1,
    /// The room has no free member slot
    MemberIsFull = 2,
    /// The room no longer exists
    RoomIsGone = 3,
}

impl TryFrom<i32> for MatchingResult {
    type Error = CodecError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MatchingResult::Success),
            1 => Ok(MatchingResult::RoomIsFull),
            2 => Ok(MatchingResult::MemberIsFull),
            3 => Ok(MatchingResult::RoomIsGone),
            _ => Err(CodecError::UnknownValue {
                field: "matching result",
                value,
            }),
        }
    }
}

/// Room create/join/search request sent by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingRequest {
    /// Client protocol version
    pub version: i32,
    /// Requested operation
    pub request: MatchingRequestId,
    /// Target room
    pub room_id: i32,
    /// Room name for creation
    pub name: String,
    /// Level bracket
    pub level: i32,
}

impl Packet for MatchingRequest {
    const ID: PacketId = PacketId::MatchingRequest;

    fn encode(&self, serializer: &mut Serializer) {
        serializer.encode(self.version);
        serializer.encode(self.request as i32);
        serializer.encode(self.room_id);
        serializer.encode_str(&self.name, ROOM_NAME_LENGTH);
        serializer.encode(self.level);
    }

    fn decode(serializer: &mut Serializer) -> Result<Self, CodecError> {
        Ok(Self {
            version: serializer.decode()?,
            request: MatchingRequestId::try_from(serializer.decode::<i32>()?)?,
            room_id: serializer.decode()?,
            name: serializer.decode_str(ROOM_NAME_LENGTH)?,
            level: serializer.decode()?,
        })
    }
}

/// Server answer to a [`MatchingRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingResponse {
    /// Outcome
    pub result: MatchingResult,
    /// Request being answered
    pub request: MatchingRequestId,
    /// Room concerned
    pub room_id: i32,
    /// Room name
    pub name: String,
    /// Current member count
    pub members: i32,
}

impl Packet for MatchingResponse {
    const ID: PacketId = PacketId::MatchingResponse;

    fn encode(&self, serializer: &mut Serializer) {
        serializer.encode(self.result as i32);
        serializer.encode(self.request as i32);
        serializer.encode(self.room_id);
        serializer.encode_str(&self.name, ROOM_NAME_LENGTH);
        serializer.encode(self.members);
    }

    fn decode(serializer: &mut Serializer) -> Result<Self, CodecError> {
        Ok(Self {
            result: MatchingResult::try_from(serializer.decode::<i32>()?)?,
            request: MatchingRequestId::try_from(serializer.decode::<i32>()?)?,
            room_id: serializer.decode()?,
            name: serializer.decode_str(ROOM_NAME_LENGTH)?,
            members: serializer.decode()?,
        })
    }
}

/// One entry of a room search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    /// Room identifier
    pub room_id: i32,
    /// Room name
    pub name: String,
    /// Current member count
    pub members: i32,
}

impl RoomInfo {
    const ENCODED_SIZE: usize = 4 + ROOM_NAME_LENGTH + 4;
}

/// Rooms open for joining
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchRoomResponse {
    /// Open rooms
    pub rooms: Vec<RoomInfo>,
}

impl Packet for SearchRoomResponse {
    const ID: PacketId = PacketId::SearchRoomResponse;

    fn encode(&self, serializer: &mut Serializer) {
        serializer.encode(self.rooms.len() as i32);
        for room in &self.rooms {
            serializer.encode(room.room_id);
            serializer.encode_str(&room.name, ROOM_NAME_LENGTH);
            serializer.encode(room.members);
        }
    }

    fn decode(serializer: &mut Serializer) -> Result<Self, CodecError> {
        let count = read_count(serializer, RoomInfo::ENCODED_SIZE)?;
        let mut rooms = Vec::with_capacity(count);
        for _ in 0..count {
            rooms.push(RoomInfo {
                room_id: serializer.decode()?,
                name: serializer.decode_str(ROOM_NAME_LENGTH)?,
                members: serializer.decode()?,
            });
        }
        Ok(Self { rooms })
    }
}

/// Address of one game session member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndPointData {
    /// Dotted IPv4 address
    pub ip_address: String,
    /// Port the member listens on
    pub port: i32,
}

impl EndPointData {
    const ENCODED_SIZE: usize = IP_ADDRESS_LENGTH + 4;
}

/// Game session start notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionData {
    /// Outcome of the start request
    pub result: MatchingResult,
    /// Index of the receiving player among the members
    pub player_id: i32,
    /// Every member's endpoint
    pub endpoints: Vec<EndPointData>,
}

impl Packet for SessionData {
    const ID: PacketId = PacketId::StartSessionNotify;

    fn encode(&self, serializer: &mut Serializer) {
        serializer.encode(self.result as i32);
        serializer.encode(self.player_id);
        serializer.encode(self.endpoints.len() as i32);
        for endpoint in &self.endpoints {
            serializer.encode_str(&endpoint.ip_address, IP_ADDRESS_LENGTH);
            serializer.encode(endpoint.port);
        }
    }

    fn decode(serializer: &mut Serializer) -> Result<Self, CodecError> {
        let result = MatchingResult::try_from(serializer.decode::<i32>()?)?;
        let player_id = serializer.decode()?;
        let count = read_count(serializer, EndPointData::ENCODED_SIZE)?;
        let mut endpoints = Vec::with_capacity(count);
        for _ in 0..count {
            endpoints.push(EndPointData {
                ip_address: serializer.decode_str(IP_ADDRESS_LENGTH)?,
                port: serializer.decode()?,
            });
        }
        Ok(Self {
            result,
            player_id,
            endpoints,
        })
    }
}

/// Read an element count and check the remaining bytes can hold it
fn read_count(serializer: &mut Serializer, entry_size: usize) -> Result<usize, CodecError> {
    let raw = serializer.decode::<i32>()?;
    let count = usize::try_from(raw).map_err(|_| CodecError::InvalidCount(raw))?;
    if count.saturating_mul(entry_size) > serializer.remaining() {
        return Err(CodecError::InvalidCount(raw));
    }
    Ok(count)
}
