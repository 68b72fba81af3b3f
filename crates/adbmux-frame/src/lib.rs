//! ADB wire message framing.
//!
//! Every message on the wire is a 24-byte header followed by a payload:
//! - command, arg0, arg1 (little-endian u32 each)
//! - payload length and payload byte-sum check (little-endian u32 each)
//! - magic, the bitwise complement of the command
//!
//! Readers always hand out complete messages; declared lengths are checked
//! against a configured maximum before any payload is buffered.

#[cfg(feature = "async")]
pub mod async_codec;
pub mod codec;
pub mod command;
pub mod error;
pub mod reader;
pub mod writer;

#[cfg(feature = "async")]
pub use async_codec::AdbCodec;
pub use codec::{
    checksum, decode_message, encode_message, FrameConfig, Message, DEFAULT_MAX_PAYLOAD,
    HEADER_SIZE,
};
pub use command::{
    command_name, is_stream_command, AUTH, AUTH_RSAPUBLICKEY, AUTH_SIGNATURE, AUTH_TOKEN, CLSE, CNXN,
    CONNECT_IDENTITY, MAX_PAYLOAD, OKAY, OPEN, VERSION, VERSION_SKIP_CHECKSUM, WRTE,
};
pub use error::{FrameError, Result};
pub use reader::MessageReader;
pub use writer::MessageWriter;
