use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use adbmux_frame::MessageWriter;
use adbmux_transport::DeviceStream;

use crate::error::Result;

/// The connection's single [`MessageWriter`], shared by every stream.
///
/// Each frame is written while holding the lock, so frames from concurrent
/// streams never interleave on the wire.
pub struct SharedWriter<W = DeviceStream> {
    inner: Arc<Mutex<MessageWriter<W>>>,
}

impl<W> Clone for SharedWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Write> SharedWriter<W> {
    pub fn new(writer: MessageWriter<W>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MessageWriter<W>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write_open(&self, local_id: u32, destination: &str) -> Result<()> {
        Ok(self.lock().write_open(local_id, destination)?)
    }

    pub fn write_okay(&self, local_id: u32, remote_id: u32) -> Result<()> {
        Ok(self.lock().write_okay(local_id, remote_id)?)
    }

    pub fn write_write(&self, local_id: u32, remote_id: u32, payload: &[u8]) -> Result<()> {
        Ok(self.lock().write_write(local_id, remote_id, payload)?)
    }

    pub fn write_close(&self, local_id: u32, remote_id: u32) -> Result<()> {
        Ok(self.lock().write_close(local_id, remote_id)?)
    }

    /// Largest payload a single frame may carry.
    pub fn max_payload_size(&self) -> usize {
        self.lock().config().max_payload_size
    }
}

impl<W> std::fmt::Debug for SharedWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWriter")
            .field("handles", &Arc::strong_count(&self.inner))
            .finish()
    }
}
