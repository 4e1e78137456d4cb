//! Network constants shared by the matching and game services.

/// Well-known protocol constants
#[derive(Debug, Clone, Copy)]
pub struct NetConfig;

impl NetConfig {
    /// Version carried in matching requests
    pub const SERVER_VERSION: i32 = 1;

    /// Players per room
    pub const PLAYER_MAX: usize = 4;

    /// Matching service port
    pub const MATCHING_SERVER_PORT: u16 = 50763;

    /// Game service port
    pub const GAME_SERVER_PORT: u16 = 50764;

    /// Direct peer-to-peer game port
    pub const GAME_PORT: u16 = 50765;
}
