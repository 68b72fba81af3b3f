use std::io::{ErrorKind, Write};

use adbmux_transport::DeviceStream;
use bytes::BytesMut;
use tracing::trace;

use crate::codec::{encode_message, FrameConfig, Message};
use crate::command::{command_name, AUTH, CLSE, CNXN, OKAY, OPEN, WRTE};
use crate::error::{FrameError, Result};
use crate::reader::transport_to_frame_error;

const INITIAL_BUFFER_CAPACITY: usize = 16 * 1024;

/// Writes complete messages to any `Write` stream.
///
/// Each call encodes one message into an internal buffer, writes all of it
/// and flushes, so a message is either fully handed to the stream or the
/// call fails.
pub struct MessageWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> MessageWriter<T> {
    /// Create a new message writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new message writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a complete message (blocking).
    pub fn write(&mut self, message: &Message) -> Result<()> {
        self.write_message(
            message.command,
            message.arg0,
            message.arg1,
            message.payload.as_ref(),
        )
    }

    /// Encode and send one message.
    pub fn write_message(
        &mut self,
        command: u32,
        arg0: u32,
        arg1: u32,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        self.buf.clear();
        encode_message(command, arg0, arg1, payload, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        trace!(
            command = command_name(command),
            arg0,
            arg1,
            len = payload.len(),
            "wrote message"
        );
        self.flush()
    }

    /// CNXN: announce protocol version, max payload and system identity.
    pub fn write_connect(
        &mut self,
        version: u32,
        max_payload: u32,
        identity: &[u8],
    ) -> Result<()> {
        self.write_message(CNXN, version, max_payload, identity)
    }

    /// AUTH of the given subtype.
    pub fn write_auth(&mut self, auth_type: u32, payload: &[u8]) -> Result<()> {
        self.write_message(AUTH, auth_type, 0, payload)
    }

    /// OPEN a stream to `destination`; the name is sent NUL-terminated.
    pub fn write_open(&mut self, local_id: u32, destination: &str) -> Result<()> {
        let mut payload = Vec::with_capacity(destination.len() + 1);
        payload.extend_from_slice(destination.as_bytes());
        payload.push(0);
        self.write_message(OPEN, local_id, 0, &payload)
    }

    /// OKAY for a stream: "ready for more".
    pub fn write_okay(&mut self, local_id: u32, remote_id: u32) -> Result<()> {
        self.write_message(OKAY, local_id, remote_id, &[])
    }

    /// WRTE stream data.
    pub fn write_write(&mut self, local_id: u32, remote_id: u32, payload: &[u8]) -> Result<()> {
        self.write_message(WRTE, local_id, remote_id, payload)
    }

    /// CLSE a stream.
    pub fn write_close(&mut self, local_id: u32, remote_id: u32) -> Result<()> {
        self.write_message(CLSE, local_id, remote_id, &[])
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent message encoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current message writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl MessageWriter<DeviceStream> {
    /// Create a message writer for `DeviceStream` and apply write timeout from config.
    pub fn with_config_device(inner: DeviceStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the write timeout of the underlying stream.
    pub fn set_write_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner
            .set_write_timeout(timeout)
            .map_err(transport_to_frame_error)?;
        self.config.write_timeout = timeout;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::codec::decode_message;
    use crate::command::{AUTH_SIGNATURE, VERSION};
    use crate::reader::MessageReader;

    fn written(writer: MessageWriter<Cursor<Vec<u8>>>) -> Vec<Message> {
        let mut wire = BytesMut::from(writer.into_inner().into_inner().as_slice());
        let config = FrameConfig {
            max_payload_size: usize::MAX,
            verify_checksum: true,
            ..FrameConfig::default()
        };
        let mut out = Vec::new();
        while let Some(message) = decode_message(&mut wire, &config).unwrap() {
            out.push(message);
        }
        out
    }

    #[test]
    fn write_single_message() {
        let mut writer = MessageWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.write_message(WRTE, 1, 2, b"hello").unwrap();

        let messages = written(writer);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], Message::new(WRTE, 1, 2, &b"hello"[..]));
    }

    #[test]
    fn helpers_use_protocol_argument_order() {
        let mut writer = MessageWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.write_connect(VERSION, 4096, b"host::\0").unwrap();
        writer.write_auth(AUTH_SIGNATURE, b"sig").unwrap();
        writer.write_open(7, "shell:ls").unwrap();
        writer.write_okay(7, 42).unwrap();
        writer.write_write(7, 42, b"data").unwrap();
        writer.write_close(7, 42).unwrap();

        let messages = written(writer);
        assert_eq!(
            messages[0],
            Message::new(CNXN, VERSION, 4096, &b"host::\0"[..])
        );
        assert_eq!(
            messages[1],
            Message::new(AUTH, AUTH_SIGNATURE, 0, &b"sig"[..])
        );
        assert_eq!(messages[2], Message::new(OPEN, 7, 0, &b"shell:ls\0"[..]));
        assert_eq!(messages[3], Message::new(OKAY, 7, 42, &b""[..]));
        assert_eq!(messages[4], Message::new(WRTE, 7, 42, &b"data"[..]));
        assert_eq!(messages[5], Message::new(CLSE, 7, 42, &b""[..]));
    }

    #[test]
    fn payload_too_large_rejected() {
        let cfg = FrameConfig {
            max_payload_size: 4,
            ..FrameConfig::default()
        };
        let mut writer = MessageWriter::with_config(Cursor::new(Vec::<u8>::new()), cfg);

        let err = writer.write_write(1, 2, b"oversized").unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 9, max: 4 }));
        assert!(writer.into_inner().into_inner().is_empty());
    }

    #[test]
    fn write_message_struct() {
        let mut writer = MessageWriter::new(Cursor::new(Vec::<u8>::new()));
        let message = Message::new(OKAY, 3, 4, Vec::<u8>::new());
        writer.write(&message).unwrap();
        assert_eq!(written(writer), vec![message]);
    }

    #[test]
    fn flush_propagates() {
        let sink = FlushTrackingWriter::default();
        let flag = Arc::clone(&sink.flushed);
        let mut writer = MessageWriter::new(sink);

        writer.write_okay(1, 1).unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn handles_interrupted_write_and_flush() {
        let mut writer = MessageWriter::new(InterruptedWriteThenFlush {
            wrote_once: false,
            flush_interrupted: false,
            data: Vec::new(),
        });
        writer.write_write(5, 6, b"retry").unwrap();

        let mut reader = MessageReader::new(Cursor::new(writer.into_inner().data));
        assert_eq!(reader.read_message().unwrap().payload.as_ref(), b"retry");
    }

    #[test]
    fn connection_closed_when_write_returns_zero() {
        let mut writer = MessageWriter::new(ZeroWriter);
        let err = writer.write_okay(1, 2).unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn accessors_and_into_inner() {
        let mut writer = MessageWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.set_max_payload_size(16);
        assert_eq!(writer.config().max_payload_size, 16);
        let _ = writer.get_ref();
        let _ = writer.get_mut();
        let _inner = writer.into_inner();
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        flushed: Arc<AtomicBool>,
        data: Vec<u8>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct InterruptedWriteThenFlush {
        wrote_once: bool,
        flush_interrupted: bool,
        data: Vec<u8>,
    }

    impl Write for InterruptedWriteThenFlush {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if !self.wrote_once {
                self.wrote_once = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            if !self.flush_interrupted {
                self.flush_interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
