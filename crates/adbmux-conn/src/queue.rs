//! Fan-out of inbound messages to logical streams.
//!
//! One reader thread owns the connection's [`MessageReader`] and pushes every
//! message into a dispatch table keyed by the client's local stream id.
//! Streams block in [`MessageQueue::take`] until something addressed to them
//! arrives. All entries live under one mutex; each entry has its own condvar
//! so a frame for one stream only wakes that stream.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use adbmux_frame::{
    command_name, is_stream_command, FrameError, Message, MessageReader, CLSE, OKAY, WRTE,
};
use tracing::{debug, trace, warn};

use crate::error::{AdbError, Result};
use crate::writer::SharedWriter;

/// Outcome of [`MessageQueue::take`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message(Message),
    /// The stream was closed by either side, or the connection was closed
    /// locally. No further messages will be delivered.
    Closed,
}

#[derive(Debug, Default)]
struct Entry {
    data: VecDeque<Message>,
    open_ack: Option<Message>,
    acked: bool,
    closed: bool,
    /// The opener gave up waiting for the open acknowledgement.
    abandoned: bool,
    wakeup: Arc<Condvar>,
}

impl Entry {
    fn pop(&mut self, command: u32) -> Option<Message> {
        match command {
            WRTE => self.data.pop_front(),
            OKAY => self.open_ack.take(),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct DispatchTable {
    entries: HashMap<u32, Entry>,
    failure: Option<String>,
    shut_down: bool,
}

/// Dispatch table shared by the reader thread and every stream.
#[derive(Debug, Default)]
pub struct MessageQueue {
    table: Mutex<DispatchTable>,
    read_timeout: Option<Duration>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every [`take`](Self::take) by `timeout`.
    pub fn with_read_timeout(timeout: Option<Duration>) -> Self {
        Self {
            table: Mutex::default(),
            read_timeout: timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `local_id`. Returns `false` if it is already registered.
    ///
    /// Must happen before the OPEN for this id is sent, so the device's
    /// answer cannot race past the registration.
    pub fn start_listening(&self, local_id: u32) -> bool {
        let mut table = self.lock();
        if table.entries.contains_key(&local_id) {
            return false;
        }
        table.entries.insert(local_id, Entry::default());
        trace!(local_id, "listening");
        true
    }

    /// Remove `local_id` and wake anyone blocked on it; they observe
    /// [`Delivery::Closed`]. Unknown ids are ignored.
    pub fn stop_listening(&self, local_id: u32) {
        let removed = self.lock().entries.remove(&local_id);
        if let Some(entry) = removed {
            trace!(local_id, dropped = entry.data.len(), "stopped listening");
            entry.wakeup.notify_all();
        }
    }

    /// Give up on an open that is still waiting for its acknowledgement.
    ///
    /// If the acknowledgement already arrived the entry is removed and the
    /// device's id is returned so the caller can close the stream. Otherwise
    /// the id stays registered until the device answers; a late OKAY is then
    /// reported by [`dispatch`](Self::dispatch) for closing.
    pub fn abandon(&self, local_id: u32) -> Option<u32> {
        let mut table = self.lock();
        let entry = table.entries.get_mut(&local_id)?;
        if let Some(ack) = entry.open_ack.take() {
            table.entries.remove(&local_id);
            return Some(ack.arg0);
        }
        if entry.closed {
            table.entries.remove(&local_id);
            return None;
        }
        entry.abandoned = true;
        entry.data.clear();
        entry.wakeup.notify_all();
        trace!(local_id, "open abandoned");
        None
    }

    pub fn is_listening(&self, local_id: u32) -> bool {
        self.lock().entries.contains_key(&local_id)
    }

    /// Number of registered streams.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until a message with `command` is available for `local_id`.
    ///
    /// `WRTE` yields data frames in arrival order, `OKAY` yields the open
    /// acknowledgement. Queued frames are handed out before a close is
    /// reported. Fails with `Disconnected` once the reader has stopped
    /// and with `Timeout` if a read timeout is configured and expires.
    pub fn take(&self, local_id: u32, command: u32) -> Result<Delivery> {
        let deadline = self.read_timeout.map(|timeout| Instant::now() + timeout);
        let mut table = self.lock();

        loop {
            let shut_down = table.shut_down;
            let failure = table.failure.clone();
            let Some(entry) = table.entries.get_mut(&local_id) else {
                return Ok(Delivery::Closed);
            };

            if let Some(message) = entry.pop(command) {
                return Ok(Delivery::Message(message));
            }
            if entry.closed || shut_down {
                return Ok(Delivery::Closed);
            }
            if let Some(reason) = failure {
                return Err(AdbError::Disconnected(reason));
            }

            let wakeup = Arc::clone(&entry.wakeup);
            table = match (deadline, self.read_timeout) {
                (Some(deadline), Some(timeout)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(AdbError::Timeout(timeout));
                    }
                    wakeup
                        .wait_timeout(table, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                _ => wakeup.wait(table).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Route one inbound message to its stream.
    ///
    /// Messages for unknown or closed streams, flow-control OKAYs after the
    /// open acknowledgement and non-stream commands are dropped. Returns the
    /// device's id when an abandoned open is acknowledged late; that stream
    /// must be closed by the caller.
    pub fn dispatch(&self, message: Message) -> Option<u32> {
        let command = message.command;
        if !is_stream_command(command) {
            warn!(
                command = command_name(command),
                arg0 = message.arg0,
                arg1 = message.arg1,
                "dropping unexpected message"
            );
            return None;
        }

        let local_id = message.arg1;
        let mut table = self.lock();
        let Some(entry) = table.entries.get_mut(&local_id) else {
            debug!(
                local_id,
                command = command_name(command),
                "dropping message for unknown stream"
            );
            return None;
        };
        if entry.abandoned {
            return match command {
                OKAY => {
                    table.entries.remove(&local_id);
                    debug!(local_id, remote_id = message.arg0, "late open acknowledgement");
                    Some(message.arg0)
                }
                CLSE => {
                    table.entries.remove(&local_id);
                    None
                }
                _ => None,
            };
        }
        if entry.closed {
            debug!(
                local_id,
                command = command_name(command),
                "dropping message for closed stream"
            );
            return None;
        }

        match command {
            WRTE => entry.data.push_back(message),
            OKAY if !entry.acked => {
                entry.acked = true;
                entry.open_ack = Some(message);
            }
            OKAY => {
                trace!(local_id, "write acknowledged");
                return None;
            }
            _ => {
                debug!(local_id, remote_id = message.arg0, "device closed stream");
                entry.closed = true;
            }
        }
        entry.wakeup.notify_all();
        None
    }

    /// Record that the reader stopped. The first reason wins; every stream
    /// that is not already closed is woken and will see `Disconnected`.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut table = self.lock();
        if table.failure.is_none() {
            table.failure = Some(reason.into());
        }
        notify_all(&table);
    }

    /// Local connection close: every registration is dropped and every
    /// stream observes [`Delivery::Closed`]. Undelivered data is discarded.
    pub fn shutdown(&self) {
        let mut table = self.lock();
        table.shut_down = true;
        for (local_id, entry) in table.entries.drain() {
            trace!(local_id, dropped = entry.data.len(), "stopped listening on shutdown");
            entry.wakeup.notify_all();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// Read and dispatch until the reader fails. Returns the error that
    /// stopped it. Late acknowledgements of abandoned opens are answered
    /// with CLSE through `writer`.
    pub fn run<R: Read, W: Write>(
        &self,
        reader: &mut MessageReader<R>,
        writer: &SharedWriter<W>,
    ) -> FrameError {
        loop {
            match reader.read_message() {
                Ok(message) => {
                    let local_id = message.arg1;
                    if let Some(remote_id) = self.dispatch(message) {
                        if let Err(err) = writer.write_close(local_id, remote_id) {
                            debug!(local_id, error = %err, "closing abandoned stream failed");
                        }
                    }
                }
                Err(err) => {
                    if self.is_shut_down() {
                        debug!("reader stopped after local close");
                    } else if matches!(err, FrameError::ConnectionClosed) {
                        debug!("device closed the connection");
                    } else {
                        warn!(error = %err, "reader failed");
                    }
                    self.fail(err.to_string());
                    return err;
                }
            }
        }
    }

    /// Spawn the reader thread for `reader`.
    pub fn spawn_reader<R: Read + Send + 'static, W: Write + Send + 'static>(
        self: &Arc<Self>,
        mut reader: MessageReader<R>,
        writer: SharedWriter<W>,
    ) -> std::io::Result<JoinHandle<()>> {
        let queue = Arc::clone(self);
        std::thread::Builder::new()
            .name("adbmux-reader".to_string())
            .spawn(move || {
                queue.run(&mut reader, &writer);
            })
    }
}

fn notify_all(table: &DispatchTable) {
    for entry in table.entries.values() {
        entry.wakeup.notify_all();
    }
}
