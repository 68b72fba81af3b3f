//! `tokio_util::codec` adapter for the ADB wire format.
//!
//! Wrap an `AsyncRead`/`AsyncWrite` in `FramedRead`/`FramedWrite` with
//! [`AdbCodec`] to get a `Stream` of [`Message`]s and a `Sink` accepting them.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_message, encode_message, FrameConfig, Message};
use crate::error::{FrameError, Result};

/// Codec for ADB messages.
#[derive(Debug, Clone, Default)]
pub struct AdbCodec {
    config: FrameConfig,
}

impl AdbCodec {
    /// Create a codec with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec with explicit configuration.
    pub fn with_config(config: FrameConfig) -> Self {
        Self { config }
    }

    /// Update maximum payload size, typically after the handshake.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }
}

impl Decoder for AdbCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        decode_message(src, &self.config)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Message> for AdbCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        Encoder::<&Message>::encode(self, &item, dst)
    }
}

impl Encoder<&Message> for AdbCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: item.payload.len(),
                max: self.config.max_payload_size,
            });
        }
        encode_message(item.command, item.arg0, item.arg1, &item.payload, dst)
    }
}
