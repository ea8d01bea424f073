//! # Error Definitions
//!
//! Failures while turning frames into bytes and back.

/// Operational failures of the frame codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The frame could not be encoded.
    Encode(String),
    /// The bytes were not a valid frame.
    Decode(String),
    /// The frame decoded but breaks a protocol rule (e.g. a cancel with a body).
    ProtocolViolation(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(msg) => write!(f, "Frame encode error: {}", msg),
            Self::Decode(msg) => write!(f, "Frame decode error: {}", msg),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// A specialized Result type for frame operations.
pub type Result<T> = std::result::Result<T, Error>;
