//! Wire codec error types.

use thiserror::Error;

/// Errors raised while decoding wire data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer holds no data at all
    #[error("nothing to decode")]
    Empty,

    /// Fewer bytes remain than the value needs
    #[error("short buffer: need {needed} bytes, {remaining} remaining")]
    Short {
        /// Bytes requested by the read
        needed: usize,
        /// Bytes left after the cursor
        remaining: usize,
    },

    /// Fixed-length text was not valid UTF-8
    #[error("invalid utf-8 in fixed-length text")]
    InvalidUtf8,

    /// Packet identifier outside the catalogue
    #[error("unknown packet id {0}")]
    UnknownPacketId(i32),

    /// Enumerated field carried a value outside its range
    #[error("unknown {field} value {value}")]
    UnknownValue {
        /// Field name
        field: &'static str,
        /// Raw value read from the wire
        value: i32,
    },

    /// Element count is negative or larger than the data can hold
    #[error("invalid element count {0}")]
    InvalidCount(i32),
}
