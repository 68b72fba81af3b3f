use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Buf, Bytes};
use tracing::debug;

use adbmux_frame::WRTE;

use crate::error::{AdbError, Result};
use crate::queue::{Delivery, MessageQueue};
use crate::writer::SharedWriter;

#[derive(Debug, Default)]
struct ReadState {
    pending: Bytes,
    eof: bool,
}

/// One logical stream on a connection (a shell, a service, a sync session).
///
/// Reads are served from the stream's queue in arrival order and each
/// consumed WRTE is acknowledged with OKAY. Writes are split into frames of
/// at most the device's max payload. The stream closes itself on drop.
pub struct AdbStream {
    local_id: u32,
    remote_id: u32,
    destination: String,
    max_payload_size: usize,
    queue: Arc<MessageQueue>,
    writer: SharedWriter,
    closed: AtomicBool,
    read_state: Mutex<ReadState>,
}

impl AdbStream {
    pub(crate) fn new(
        local_id: u32,
        remote_id: u32,
        destination: impl Into<String>,
        queue: Arc<MessageQueue>,
        writer: SharedWriter,
    ) -> Self {
        let max_payload_size = writer.max_payload_size().max(1);
        Self {
            local_id,
            remote_id,
            destination: destination.into(),
            max_payload_size,
            queue,
            writer,
            closed: AtomicBool::new(false),
            read_state: Mutex::default(),
        }
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// The service this stream was opened to.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// True once either this stream or its connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.queue.is_shut_down()
    }

    /// Read into `buf`. Returns 0 at end of stream.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self
            .read_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if !state.pending.is_empty() {
                let n = buf.len().min(state.pending.len());
                buf[..n].copy_from_slice(&state.pending[..n]);
                state.pending.advance(n);
                if state.pending.is_empty() {
                    self.acknowledge()?;
                }
                return Ok(n);
            }
            if state.eof {
                return Ok(0);
            }

            match self.queue.take(self.local_id, WRTE)? {
                Delivery::Message(message) if message.payload.is_empty() => {
                    self.acknowledge()?;
                }
                Delivery::Message(message) => state.pending = message.payload,
                Delivery::Closed => {
                    state.eof = true;
                    if let Err(err) = self.close() {
                        debug!(
                            local_id = self.local_id,
                            error = %err,
                            "close after remote close failed"
                        );
                    }
                    return Ok(0);
                }
            }
        }
    }

    /// Read until `buf` is full or the stream ends; returns the bytes read.
    pub fn read_fully(&self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }

    /// Write all of `data`, one WRTE per `max_payload_size` chunk.
    ///
    /// Does not wait for the device's OKAY between chunks.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(AdbError::StreamClosed(self.local_id));
        }
        for chunk in data.chunks(self.max_payload_size) {
            self.writer.write_write(self.local_id, self.remote_id, chunk)?;
        }
        Ok(())
    }

    /// Close the stream. Only the first call sends CLSE; any thread blocked
    /// in [`read`](Self::read) wakes up and sees end of stream. Once the
    /// connection is closed there is nothing left to send.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.queue.is_shut_down() {
            self.queue.stop_listening(self.local_id);
            return Ok(());
        }
        debug!(
            local_id = self.local_id,
            remote_id = self.remote_id,
            destination = %self.destination,
            "closing stream"
        );
        let sent = self.writer.write_close(self.local_id, self.remote_id);
        self.queue.stop_listening(self.local_id);
        sent
    }

    fn acknowledge(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.writer.write_okay(self.local_id, self.remote_id)
    }
}

impl Drop for AdbStream {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(local_id = self.local_id, error = %err, "close on drop failed");
        }
    }
}

impl std::fmt::Debug for AdbStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbStream")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("destination", &self.destination)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl io::Read for &AdbStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        AdbStream::read(*self, buf).map_err(io::Error::from)
    }
}

impl io::Read for AdbStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        AdbStream::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Write for &AdbStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        AdbStream::write(*self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for AdbStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        AdbStream::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
