//! Packet header and the packet-type catalogue.
//!
//! Every message on the wire starts with a 4-byte packet identifier in
//! network byte order, followed by the payload.

use crate::error::CodecError;
use crate::serializer::Serializer;
use bytes::Bytes;
use std::fmt;

/// Packet header size in bytes
pub const PACKET_HEADER_SIZE: usize = 4;

/// Packet types known to the matching and game services
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketId {
    /// Room create/join/search request
    MatchingRequest = 0,
    /// Answer to a matching request
    MatchingResponse = 1,
    /// List of open rooms
    SearchRoomResponse = 2,
    /// Game session start with the member endpoints
    StartSessionNotify = 3,
    /// Equipment selection
    Equip = 4,
    /// Periodic game state sync
    GameSyncInfo = 5,
    /// Character position and state
    CharacterData = 6,
    /// Attack action
    AttackData = 7,
    /// Item pickup/drop
    ItemData = 8,
    /// Item usage
    UseItem = 9,
    /// Door open/close state
    DoorState = 10,
    /// Room change
    MovingRoom = 11,
    /// Hit point update
    HpData = 12,
    /// Damage dealt
    DamageData = 13,
    /// Damage notification
    DamageNotify = 14,
    /// Monster state
    MonsterData = 15,
    /// Summon action
    Summon = 16,
    /// Boss melee attack
    BossDirectAttack = 17,
    /// Boss ranged attack
    BossRangeAttack = 18,
    /// Prize draw
    Prize = 19,
    /// Prize draw outcome
    PrizeResult = 20,
    /// Chat text
    ChatMessage = 21,
}

impl PacketId {
    /// Every packet type in wire order
    pub const ALL: [PacketId; 22] = [
        PacketId::MatchingRequest,
        PacketId::MatchingResponse,
        PacketId::SearchRoomResponse,
        PacketId::StartSessionNotify,
        PacketId::Equip,
        PacketId::GameSyncInfo,
        PacketId::CharacterData,
        PacketId::AttackData,
        PacketId::ItemData,
        PacketId::UseItem,
        PacketId::DoorState,
        PacketId::MovingRoom,
        PacketId::HpData,
        PacketId::DamageData,
        PacketId::DamageNotify,
        PacketId::MonsterData,
        PacketId::Summon,
        PacketId::BossDirectAttack,
        PacketId::BossRangeAttack,
        PacketId::Prize,
        PacketId::PrizeResult,
        PacketId::ChatMessage,
    ];

    /// Raw wire value
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for PacketId {
    type Error = CodecError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
            .ok_or(CodecError::UnknownPacketId(value))
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_i32())
    }
}

/// Fixed header carried in front of every payload
///
/// The identifier is kept raw so that packets from newer peers can be
/// decoded and dropped by the router instead of failing the header read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Raw packet-type identifier
    pub packet_id: i32,
}

impl PacketHeader {
    /// Create a header for a catalogued packet type
    pub fn new(packet_id: PacketId) -> Self {
        Self {
            packet_id: packet_id.as_i32(),
        }
    }

    /// Catalogued packet type, if the identifier is known
    pub fn packet_type(&self) -> Result<PacketId, CodecError> {
        PacketId::try_from(self.packet_id)
    }

    /// Append the header to a serializer
    pub fn encode(&self, serializer: &mut Serializer) {
        serializer.encode(self.packet_id);
    }

    /// Encode the header on its own
    pub fn to_bytes(&self) -> Bytes {
        let mut serializer = Serializer::new();
        self.encode(&mut serializer);
        serializer.into_bytes()
    }

    /// Read a header from the serializer cursor
    pub fn decode(serializer: &mut Serializer) -> Result<Self, CodecError> {
        let packet_id = serializer.decode::<i32>()?;
        Ok(Self { packet_id })
    }

    /// Split a received message into its header and payload
    pub fn split(message: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let mut serializer = Serializer::from_bytes(message);
        let header = Self::decode(&mut serializer)?;
        Ok((header, &message[PACKET_HEADER_SIZE..]))
    }
}
