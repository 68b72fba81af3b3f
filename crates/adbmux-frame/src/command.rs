//! Protocol commands and constants.
//!
//! Commands are four ASCII bytes read as a little-endian u32, so `CNXN` on
//! the wire is the bytes `b"CNXN"`.

/// Connection request / acceptance.
pub const CNXN: u32 = 0x4e58_4e43;

/// Authentication challenge or response.
pub const AUTH: u32 = 0x4854_5541;

/// Open a stream to a named service.
pub const OPEN: u32 = 0x4e45_504f;

/// Stream open acknowledgement, and "ready for more" flow-control ack.
pub const OKAY: u32 = 0x5941_4b4f;

/// Stream close.
pub const CLSE: u32 = 0x4553_4c43;

/// Stream data.
pub const WRTE: u32 = 0x4554_5257;

/// AUTH subtype: challenge token sent by the device.
pub const AUTH_TOKEN: u32 = 1;

/// AUTH subtype: signed token sent by the client.
pub const AUTH_SIGNATURE: u32 = 2;

/// AUTH subtype: public key offered by the client.
pub const AUTH_RSAPUBLICKEY: u32 = 3;

/// Protocol version sent by the client.
pub const VERSION: u32 = 0x0100_0000;

/// First protocol version that no longer fills in the payload check field.
pub const VERSION_SKIP_CHECKSUM: u32 = 0x0100_0001;

/// Largest payload the client advertises in its CNXN.
pub const MAX_PAYLOAD: u32 = 1024 * 1024;

/// System identity sent in the client's CNXN payload.
pub const CONNECT_IDENTITY: &[u8] = b"host::\0";

/// Returns a human-readable name for a command.
pub fn command_name(command: u32) -> &'static str {
    match command {
        CNXN => "CNXN",
        AUTH => "AUTH",
        OPEN => "OPEN",
        OKAY => "OKAY",
        CLSE => "CLSE",
        WRTE => "WRTE",
        _ => "UNKNOWN",
    }
}

/// Returns true for commands addressed to a single stream.
///
/// For these the client's local stream id is carried in `arg1`.
pub fn is_stream_command(command: u32) -> bool {
    matches!(command, OKAY | CLSE | WRTE)
}
