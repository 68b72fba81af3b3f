/// Errors that can occur during message encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header magic is not the complement of the command.
    #[error("invalid message magic 0x{magic:08x} for command 0x{command:08x}")]
    InvalidMagic { command: u32, magic: u32 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The payload byte-sum does not match the header.
    #[error("payload checksum mismatch (header 0x{expected:08x}, payload 0x{actual:08x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// An I/O error occurred while reading or writing messages.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete message was received.
    #[error("connection closed (incomplete message)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
