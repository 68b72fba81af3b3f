//! The shell v2 sub-protocol.
//!
//! A `shell,v2,raw:<command>` stream carries packets of
//! `[u8 id][i32 LE length][payload]`. The device sends STDOUT, STDERR and
//! finally a one-byte EXIT packet; the client may send STDIN, CLOSE_STDIN
//! and WINDOW_SIZE_CHANGE.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tracing::debug;

use crate::error::{AdbError, Result};
use crate::stream::AdbStream;

pub const SHELL_ID_STDIN: u8 = 0;
pub const SHELL_ID_STDOUT: u8 = 1;
pub const SHELL_ID_STDERR: u8 = 2;
pub const SHELL_ID_EXIT: u8 = 3;
pub const SHELL_ID_CLOSE_STDIN: u8 = 4;
pub const SHELL_ID_WINDOW_SIZE_CHANGE: u8 = 5;

/// Packet header: id byte plus little-endian length.
pub const SHELL_HEADER_SIZE: usize = 5;

/// Largest shell packet payload accepted from the device.
pub const MAX_SHELL_PACKET: usize = 16 * 1024 * 1024;

/// Shell packet ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShellPacketId {
    Stdin = SHELL_ID_STDIN,
    Stdout = SHELL_ID_STDOUT,
    Stderr = SHELL_ID_STDERR,
    Exit = SHELL_ID_EXIT,
    CloseStdin = SHELL_ID_CLOSE_STDIN,
    WindowSizeChange = SHELL_ID_WINDOW_SIZE_CHANGE,
}

impl ShellPacketId {
    pub fn from_u8(id: u8) -> Option<Self> {
        match id {
            SHELL_ID_STDIN => Some(Self::Stdin),
            SHELL_ID_STDOUT => Some(Self::Stdout),
            SHELL_ID_STDERR => Some(Self::Stderr),
            SHELL_ID_EXIT => Some(Self::Exit),
            SHELL_ID_CLOSE_STDIN => Some(Self::CloseStdin),
            SHELL_ID_WINDOW_SIZE_CHANGE => Some(Self::WindowSizeChange),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Stdin => "STDIN",
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
            Self::Exit => "EXIT",
            Self::CloseStdin => "CLOSE_STDIN",
            Self::WindowSizeChange => "WINDOW_SIZE_CHANGE",
        }
    }

    /// Ids the device may send to the client.
    fn is_inbound(self) -> bool {
        matches!(self, Self::Stdout | Self::Stderr | Self::Exit)
    }
}

/// One decoded shell packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellPacket {
    pub id: ShellPacketId,
    pub payload: Bytes,
}

impl ShellPacket {
    /// Exit status carried by an EXIT packet.
    pub fn exit_code(&self) -> Option<u8> {
        match self.id {
            ShellPacketId::Exit => self.payload.first().copied(),
            _ => None,
        }
    }
}

impl fmt::Display for ShellPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code() {
            Some(code) => write!(f, "{}: {code}", self.id.name()),
            None => write!(
                f,
                "{}: {}",
                self.id.name(),
                String::from_utf8_lossy(&self.payload)
            ),
        }
    }
}

/// Collected result of a shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u8,
}

impl ShellResponse {
    /// stdout followed by stderr.
    pub fn all_output(&self) -> String {
        let mut all = String::with_capacity(self.stdout.len() + self.stderr.len());
        all.push_str(&self.stdout);
        all.push_str(&self.stderr);
        all
    }
}

impl fmt::Display for ShellResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shell response ({}):\n{}", self.exit_code, self.all_output())
    }
}

/// Shell v2 framing over an [`AdbStream`].
#[derive(Debug)]
pub struct ShellStream {
    stream: AdbStream,
}

impl ShellStream {
    pub fn new(stream: AdbStream) -> Self {
        Self { stream }
    }

    /// Read the next packet. `Ok(None)` means the stream ended cleanly
    /// between packets.
    ///
    /// Anything malformed is a `Protocol` error and closes this stream; the
    /// connection and its other streams are unaffected.
    pub fn read_packet(&self) -> Result<Option<ShellPacket>> {
        let result = self.read_packet_inner();
        if let Err(AdbError::Protocol(reason)) = &result {
            debug!(local_id = self.stream.local_id(), %reason, "closing malformed shell stream");
            if let Err(err) = self.stream.close() {
                debug!(error = %err, "close after shell protocol error failed");
            }
        }
        result
    }

    fn read_packet_inner(&self) -> Result<Option<ShellPacket>> {
        let mut header = [0u8; SHELL_HEADER_SIZE];
        match self.stream.read_fully(&mut header)? {
            0 => return Ok(None),
            SHELL_HEADER_SIZE => {}
            n => {
                return Err(AdbError::Protocol(format!(
                    "stream ended inside a shell packet header ({n} of {SHELL_HEADER_SIZE} bytes)"
                )))
            }
        }

        let id = ShellPacketId::from_u8(header[0])
            .filter(|id| id.is_inbound())
            .ok_or_else(|| AdbError::Protocol(format!("invalid shell packet id: {}", header[0])))?;

        let length = i32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        let length = usize::try_from(length).map_err(|_| {
            AdbError::Protocol(format!("shell packet length must be >= 0: {length}"))
        })?;
        if id == ShellPacketId::Exit && length != 1 {
            return Err(AdbError::Protocol(format!(
                "shell exit packet must have a 1-byte payload, got {length}"
            )));
        }
        if length > MAX_SHELL_PACKET {
            return Err(AdbError::Protocol(format!(
                "shell packet too large: {length} (max {MAX_SHELL_PACKET})"
            )));
        }

        let mut payload = vec![0u8; length];
        let read = self.stream.read_fully(&mut payload)?;
        if read != length {
            return Err(AdbError::Protocol(format!(
                "stream ended inside a {} packet ({read} of {length} bytes)",
                id.name()
            )));
        }

        Ok(Some(ShellPacket {
            id,
            payload: Bytes::from(payload),
        }))
    }

    /// Collect stdout and stderr until the EXIT packet.
    pub fn read_all(&self) -> Result<ShellResponse> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        loop {
            let Some(packet) = self.read_packet()? else {
                return Err(AdbError::Protocol(
                    "shell stream ended before the exit packet".to_string(),
                ));
            };
            match packet.id {
                ShellPacketId::Stdout => stdout.extend_from_slice(&packet.payload),
                ShellPacketId::Stderr => stderr.extend_from_slice(&packet.payload),
                ShellPacketId::Exit => {
                    return Ok(ShellResponse {
                        stdout: String::from_utf8_lossy(&stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&stderr).into_owned(),
                        exit_code: packet.exit_code().unwrap_or_default(),
                    });
                }
                other => {
                    return Err(AdbError::Protocol(format!(
                        "invalid shell packet id: {}",
                        other.as_u8()
                    )))
                }
            }
        }
    }

    /// Send `text` to the command's stdin.
    pub fn write_stdin(&self, text: &str) -> Result<()> {
        self.write_packet(ShellPacketId::Stdin, text.as_bytes())
    }

    /// Tell the command no more stdin is coming.
    pub fn close_stdin(&self) -> Result<()> {
        self.write_packet(ShellPacketId::CloseStdin, &[])
    }

    /// Report a terminal size change (character cells and pixels).
    pub fn resize(&self, rows: u32, cols: u32, width: u32, height: u32) -> Result<()> {
        let payload = format!("{rows}x{cols},{width}x{height}\0");
        self.write_packet(ShellPacketId::WindowSizeChange, payload.as_bytes())
    }

    /// Send one packet. Header and payload go out in a single stream write.
    pub fn write_packet(&self, id: ShellPacketId, payload: &[u8]) -> Result<()> {
        let length = i32::try_from(payload.len()).map_err(|_| {
            AdbError::Protocol(format!("shell packet too large: {}", payload.len()))
        })?;
        let mut buf = BytesMut::with_capacity(SHELL_HEADER_SIZE + payload.len());
        buf.put_u8(id.as_u8());
        buf.put_i32_le(length);
        buf.put_slice(payload);
        self.stream.write(&buf)
    }

    pub fn stream(&self) -> &AdbStream {
        &self.stream
    }

    pub fn into_inner(self) -> AdbStream {
        self.stream
    }

    pub fn close(&self) -> Result<()> {
        self.stream.close()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use adbmux_frame::{OKAY, WRTE};

    use super::*;
    use crate::stream::tests::Harness;

    fn packet(id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![id];
        out.extend_from_slice(&(payload.len() as i32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn shell(h: &Harness, local_id: u32, remote_id: u32) -> ShellStream {
        ShellStream::new(h.stream(local_id, remote_id))
    }

    #[test]
    fn read_all_collects_until_exit() {
        let mut h = Harness::new(1024);
        let shell = shell(&h, 1, 10);

        let mut wire = packet(SHELL_ID_STDOUT, b"hi\n");
        wire.extend(packet(SHELL_ID_STDERR, b"warn\n"));
        wire.extend(packet(SHELL_ID_STDOUT, b"more\n"));
        wire.extend(packet(SHELL_ID_EXIT, &[3]));
        // Split across frames at an awkward offset.
        h.device_writer.write_write(10, 1, &wire[..7]).unwrap();
        h.device_writer.write_write(10, 1, &wire[7..]).unwrap();

        let response = shell.read_all().unwrap();
        assert_eq!(response.stdout, "hi\nmore\n");
        assert_eq!(response.stderr, "warn\n");
        assert_eq!(response.exit_code, 3);
        assert_eq!(response.all_output(), "hi\nmore\nwarn\n");
        assert_eq!(response.to_string(), "Shell response (3):\nhi\nmore\nwarn\n");
    }

    #[test]
    fn exit_code_is_unsigned() {
        let mut h = Harness::new(1024);
        let shell = shell(&h, 1, 10);
        h.device_writer
            .write_write(10, 1, &packet(SHELL_ID_EXIT, &[255]))
            .unwrap();
        assert_eq!(shell.read_all().unwrap().exit_code, 255);
    }

    #[test]
    fn multibyte_utf8_split_across_packets() {
        let mut h = Harness::new(1024);
        let shell = shell(&h, 1, 10);
        let snowman = "☃".as_bytes();

        let mut wire = packet(SHELL_ID_STDOUT, &snowman[..1]);
        wire.extend(packet(SHELL_ID_STDOUT, &snowman[1..]));
        wire.extend(packet(SHELL_ID_EXIT, &[0]));
        h.device_writer.write_write(10, 1, &wire).unwrap();

        assert_eq!(shell.read_all().unwrap().stdout, "☃");
    }

    #[test]
    fn invalid_id_is_protocol_error_and_closes_stream() {
        let mut h = Harness::new(1024);
        let shell = shell(&h, 1, 10);
        h.device_writer
            .write_write(10, 1, &packet(SHELL_ID_STDIN, b"x"))
            .unwrap();

        let err = shell.read_packet().unwrap_err();
        assert!(matches!(err, AdbError::Protocol(msg) if msg.contains("invalid shell packet id")));
        assert!(shell.stream().is_closed());
    }

    #[test]
    fn negative_length_rejected() {
        let mut h = Harness::new(1024);
        let shell = shell(&h, 1, 10);
        let mut wire = vec![SHELL_ID_STDOUT];
        wire.extend_from_slice(&(-1i32).to_le_bytes());
        h.device_writer.write_write(10, 1, &wire).unwrap();

        let err = shell.read_packet().unwrap_err();
        assert!(matches!(err, AdbError::Protocol(msg) if msg.contains(">= 0")));
    }

    #[test]
    fn exit_packet_must_be_one_byte() {
        let mut h = Harness::new(1024);
        let shell = shell(&h, 1, 10);
        h.device_writer
            .write_write(10, 1, &packet(SHELL_ID_EXIT, &[0, 0]))
            .unwrap();

        assert!(matches!(shell.read_packet(), Err(AdbError::Protocol(_))));
    }

    #[test]
    fn eof_before_exit_is_protocol_error() {
        let mut h = Harness::new(1024);
        let shell = shell(&h, 1, 10);
        h.device_writer
            .write_write(10, 1, &packet(SHELL_ID_STDOUT, b"partial"))
            .unwrap();
        h.device_writer.write_close(10, 1).unwrap();

        let err = shell.read_all().unwrap_err();
        assert!(matches!(err, AdbError::Protocol(msg) if msg.contains("before the exit packet")));
    }

    #[test]
    fn eof_inside_packet_is_protocol_error() {
        let mut h = Harness::new(1024);
        let shell = shell(&h, 1, 10);
        let wire = packet(SHELL_ID_STDOUT, b"truncated");
        h.device_writer.write_write(10, 1, &wire[..8]).unwrap();
        h.device_writer.write_close(10, 1).unwrap();

        assert!(matches!(shell.read_packet(), Err(AdbError::Protocol(_))));
    }

    #[test]
    fn read_packet_at_clean_eof_is_none() {
        let mut h = Harness::new(1024);
        let shell = shell(&h, 1, 10);
        h.device_writer.write_close(10, 1).unwrap();
        assert_eq!(shell.read_packet().unwrap(), None);
    }

    #[test]
    fn outbound_packets_are_framed() {
        let mut h = Harness::new(1024);
        let shell = shell(&h, 1, 10);

        shell.write_stdin("ls\n").unwrap();
        shell.write_stdin("").unwrap();
        shell.close_stdin().unwrap();
        shell.resize(24, 80, 0, 0).unwrap();

        let frames: Vec<_> = (0..4).map(|_| h.next()).collect();
        for frame in &frames {
            assert_eq!((frame.command, frame.arg0, frame.arg1), (WRTE, 1, 10));
        }
        assert_eq!(frames[0].payload.as_ref(), packet(SHELL_ID_STDIN, b"ls\n"));
        assert_eq!(frames[1].payload.as_ref(), packet(SHELL_ID_STDIN, b""));
        assert_eq!(frames[2].payload.as_ref(), packet(SHELL_ID_CLOSE_STDIN, b""));
        assert_eq!(
            frames[3].payload.as_ref(),
            packet(SHELL_ID_WINDOW_SIZE_CHANGE, b"24x80,0x0\0")
        );
    }

    #[test]
    fn large_packet_spans_frames() {
        let mut h = Harness::new(8);
        let shell = shell(&h, 1, 10);
        shell.write_stdin("0123456789").unwrap();

        let mut wire = Vec::new();
        while wire.len() < SHELL_HEADER_SIZE + 10 {
            let frame = h.next();
            assert!(frame.payload.len() <= 8);
            wire.extend_from_slice(&frame.payload);
        }
        assert_eq!(wire, packet(SHELL_ID_STDIN, b"0123456789"));
    }

    #[test]
    fn reading_acknowledges_each_frame() {
        let mut h = Harness::new(1024);
        let shell = shell(&h, 1, 10);
        h.device_writer
            .write_write(10, 1, &packet(SHELL_ID_STDOUT, b"a"))
            .unwrap();
        h.device_writer
            .write_write(10, 1, &packet(SHELL_ID_EXIT, &[0]))
            .unwrap();

        shell.read_all().unwrap();
        assert_eq!(h.next().command, OKAY);
        assert_eq!(h.next().command, OKAY);
    }

    #[test]
    fn packet_display() {
        let out = ShellPacket {
            id: ShellPacketId::Stdout,
            payload: Bytes::from_static(b"text"),
        };
        assert_eq!(out.to_string(), "STDOUT: text");
        let exit = ShellPacket {
            id: ShellPacketId::Exit,
            payload: Bytes::from_static(&[7]),
        };
        assert_eq!(exit.to_string(), "EXIT: 7");
        assert_eq!(exit.exit_code(), Some(7));
        assert_eq!(ShellPacketId::from_u8(9), None);
    }
}
