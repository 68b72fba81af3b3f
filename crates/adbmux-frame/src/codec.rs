use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::command::{command_name, MAX_PAYLOAD};
use crate::error::{FrameError, Result};

/// Header: command, arg0, arg1, length, check, magic (4 bytes each).
pub const HEADER_SIZE: usize = 24;

/// Default maximum payload size accepted from the peer: 1 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = MAX_PAYLOAD as usize;

/// One protocol message.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Command tag (`CNXN`, `WRTE`, ...).
    pub command: u32,
    /// First argument; meaning depends on the command.
    pub arg0: u32,
    /// Second argument; meaning depends on the command.
    pub arg1: u32,
    /// The message payload.
    pub payload: Bytes,
}

impl Message {
    /// Create a new message.
    pub fn new(command: u32, arg0: u32, arg1: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload: payload.into(),
        }
    }

    /// The total wire size of this message (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Name of the command for diagnostics.
    pub fn command_name(&self) -> &'static str {
        command_name(self.command)
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("command", &self.command_name())
            .field("arg0", &self.arg0)
            .field("arg1", &self.arg1)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Byte-sum of the payload, as carried in the header check field.
pub fn checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |sum, &byte| sum.wrapping_add(u32::from(byte)))
}

/// Encode a message into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────┬──────────┬──────────┬──────────┬──────────┬──────────┬─────────────────┐
/// │ Command  │ Arg0     │ Arg1     │ Length   │ Check    │ Magic    │ Payload         │
/// │ (4B LE)  │ (4B LE)  │ (4B LE)  │ (4B LE)  │ (4B LE)  │ !Command │ (Length bytes)  │
/// └──────────┴──────────┴──────────┴──────────┴──────────┴──────────┴─────────────────┘
/// ```
pub fn encode_message(
    command: u32,
    arg0: u32,
    arg1: u32,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32_le(command);
    dst.put_u32_le(arg0);
    dst.put_u32_le(arg1);
    dst.put_u32_le(len);
    dst.put_u32_le(checksum(payload));
    dst.put_u32_le(command ^ 0xffff_ffff);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a message from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete message yet.
/// On success, consumes the message bytes from the buffer. The declared
/// length is validated as soon as the header is available, so an oversized
/// declaration fails without waiting for (or buffering) its payload.
pub fn decode_message(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<Message>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut header = &src[..HEADER_SIZE];
    let command = header.get_u32_le();
    let arg0 = header.get_u32_le();
    let arg1 = header.get_u32_le();
    let payload_len = header.get_u32_le() as usize;
    let check = header.get_u32_le();
    let magic = header.get_u32_le();

    if magic != command ^ 0xffff_ffff {
        return Err(FrameError::InvalidMagic { command, magic });
    }

    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: config.max_payload_size,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    if config.verify_checksum {
        let actual = checksum(&payload);
        if actual != check {
            return Err(FrameError::ChecksumMismatch {
                expected: check,
                actual,
            });
        }
    }

    Ok(Some(Message {
        command,
        arg0,
        arg1,
        payload,
    }))
}

/// Configuration for the message codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 1 MiB.
    pub max_payload_size: usize,
    /// Reject messages whose payload byte-sum does not match the header.
    /// Off by default: peers at `VERSION_SKIP_CHECKSUM` and later send zero.
    pub verify_checksum: bool,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            verify_checksum: false,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CLSE, CNXN, OKAY, WRTE};

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let payload = b"device::ro.product.name=sdk;";

        encode_message(CNXN, 0x0100_0000, 4096, payload, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + payload.len());

        let message = decode_message(&mut buf, &FrameConfig::default())
            .unwrap()
            .unwrap();

        assert_eq!(message.command, CNXN);
        assert_eq!(message.arg0, 0x0100_0000);
        assert_eq!(message.arg1, 4096);
        assert_eq!(message.payload.as_ref(), payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let mut buf = BytesMut::new();
        encode_message(WRTE, 1, 2, b"ab", &mut buf).unwrap();

        assert_eq!(&buf[0..4], b"WRTE");
        assert_eq!(&buf[4..8], &[1, 0, 0, 0]);
        assert_eq!(&buf[8..12], &[2, 0, 0, 0]);
        assert_eq!(&buf[12..16], &[2, 0, 0, 0]);
        assert_eq!(&buf[16..20], &(u32::from(b'a') + u32::from(b'b')).to_le_bytes());
        assert_eq!(&buf[20..24], &(WRTE ^ 0xffff_ffff).to_le_bytes());
        assert_eq!(&buf[24..], b"ab");
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&b"OKAY\x01\x00"[..]);
        let result = decode_message(&mut buf, &FrameConfig::default()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_message(WRTE, 1, 2, b"hello", &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);

        let result = decode_message(&mut buf, &FrameConfig::default()).unwrap();
        assert!(result.is_none());
        assert_eq!(buf.len(), HEADER_SIZE + 2);
    }

    #[test]
    fn test_decode_invalid_magic() {
        let mut buf = BytesMut::new();
        encode_message(OKAY, 1, 2, b"", &mut buf).unwrap();
        buf[20] ^= 0x01;

        let result = decode_message(&mut buf, &FrameConfig::default());
        assert!(matches!(
            result,
            Err(FrameError::InvalidMagic { command: OKAY, .. })
        ));
    }

    #[test]
    fn test_decode_payload_too_large_without_payload_bytes() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(WRTE);
        buf.put_u32_le(1);
        buf.put_u32_le(2);
        buf.put_u32_le(2 * 1024 * 1024);
        buf.put_u32_le(0);
        buf.put_u32_le(WRTE ^ 0xffff_ffff);

        let result = decode_message(&mut buf, &FrameConfig::default());
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_decode_negative_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(WRTE);
        buf.put_u32_le(1);
        buf.put_u32_le(2);
        buf.put_i32_le(-1);
        buf.put_u32_le(0);
        buf.put_u32_le(WRTE ^ 0xffff_ffff);

        let result = decode_message(&mut buf, &FrameConfig::default());
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size, .. }) if size == u32::MAX as usize
        ));
    }

    #[test]
    fn test_checksum_verification_is_opt_in() {
        let mut wire = BytesMut::new();
        encode_message(WRTE, 1, 2, b"data", &mut wire).unwrap();
        wire[16] = 0;
        wire[17] = 0;

        let mut lenient = wire.clone();
        assert!(decode_message(&mut lenient, &FrameConfig::default())
            .unwrap()
            .is_some());

        let strict = FrameConfig {
            verify_checksum: true,
            ..FrameConfig::default()
        };
        let result = decode_message(&mut wire, &strict);
        assert!(matches!(result, Err(FrameError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_multiple_messages() {
        let mut buf = BytesMut::new();
        encode_message(WRTE, 1, 7, b"first", &mut buf).unwrap();
        encode_message(CLSE, 1, 7, b"", &mut buf).unwrap();

        let config = FrameConfig::default();
        let m1 = decode_message(&mut buf, &config).unwrap().unwrap();
        assert_eq!((m1.command, m1.payload.as_ref()), (WRTE, b"first".as_ref()));

        let m2 = decode_message(&mut buf, &config).unwrap().unwrap();
        assert_eq!(m2.command, CLSE);
        assert!(m2.payload.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_payload_at_exact_limit_accepted() {
        let config = FrameConfig {
            max_payload_size: 8,
            ..FrameConfig::default()
        };
        let mut buf = BytesMut::new();
        encode_message(WRTE, 1, 2, &[7u8; 8], &mut buf).unwrap();
        let message = decode_message(&mut buf, &config).unwrap().unwrap();
        assert_eq!(message.payload.len(), 8);
    }

    #[test]
    fn test_message_debug_and_wire_size() {
        let message = Message::new(OKAY, 3, 9, Bytes::from_static(b"test"));
        assert_eq!(message.wire_size(), HEADER_SIZE + 4);
        let debug = format!("{message:?}");
        assert!(debug.contains("OKAY"));
        assert!(debug.contains("payload_len: 4"));
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(&[0xff, 0x01]), 0x100);
    }
}
