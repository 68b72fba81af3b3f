use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use adbmux_frame::{FrameConfig, MessageReader, MessageWriter, OKAY};
use adbmux_transport::DeviceStream;
use tracing::{debug, info, warn};

use crate::banner::ConnectionBanner;
use crate::error::{AdbError, Result};
use crate::handshake::{handshake_client_with_config, AuthMethod, HandshakeConfig};
use crate::keypair::AdbKeyPair;
use crate::queue::{Delivery, MessageQueue};
use crate::shell::{ShellResponse, ShellStream};
use crate::stream::AdbStream;
use crate::writer::SharedWriter;

/// Connection tuning.
#[derive(Debug, Clone, Default)]
pub struct ConnectConfig {
    pub handshake: HandshakeConfig,
    /// Bound on establishing the TCP connection.
    pub connect_timeout: Option<Duration>,
    /// Bound on each blocking stream read. `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
    /// Bound on each socket write after the handshake.
    pub write_timeout: Option<Duration>,
    /// Verify the payload byte-sum of inbound frames.
    pub verify_checksum: bool,
}

/// An authenticated connection to one device.
///
/// Owns the transport, the reader thread that feeds every stream, and the
/// writer shared by every stream. Dropping it closes the connection.
pub struct AdbConnection {
    version: u32,
    max_payload_size: u32,
    banner: ConnectionBanner,
    auth: AuthMethod,
    transport: DeviceStream,
    queue: Arc<MessageQueue>,
    writer: SharedWriter,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
    next_local_id: AtomicU32,
    closed: AtomicBool,
}

impl AdbConnection {
    /// Handshake over an already-connected transport.
    pub fn connect(stream: DeviceStream, key_pair: Option<&dyn AdbKeyPair>) -> Result<Self> {
        Self::connect_with_config(stream, key_pair, &ConnectConfig::default())
    }

    /// Handshake over an already-connected transport with explicit configuration.
    ///
    /// On failure the transport is shut down before the error is returned.
    pub fn connect_with_config(
        stream: DeviceStream,
        key_pair: Option<&dyn AdbKeyPair>,
        config: &ConnectConfig,
    ) -> Result<Self> {
        match Self::establish(&stream, key_pair, config) {
            Ok((reader, writer, handshake)) => {
                let queue = Arc::new(MessageQueue::with_read_timeout(config.read_timeout));
                let writer = SharedWriter::new(writer);
                let reader_thread = match queue.spawn_reader(reader, writer.clone()) {
                    Ok(handle) => handle,
                    Err(err) => {
                        shutdown_quietly(&stream);
                        return Err(AdbError::Transport(err.into()));
                    }
                };
                Ok(Self {
                    version: handshake.version,
                    max_payload_size: handshake.max_payload_size,
                    banner: handshake.banner,
                    auth: handshake.auth,
                    transport: stream,
                    queue,
                    writer,
                    reader_thread: Mutex::new(Some(reader_thread)),
                    next_local_id: AtomicU32::new(1),
                    closed: AtomicBool::new(false),
                })
            }
            Err(err) => {
                debug!(error = %err, "handshake failed, closing transport");
                shutdown_quietly(&stream);
                Err(err)
            }
        }
    }

    fn establish(
        stream: &DeviceStream,
        key_pair: Option<&dyn AdbKeyPair>,
        config: &ConnectConfig,
    ) -> Result<(
        MessageReader<DeviceStream>,
        MessageWriter<DeviceStream>,
        crate::handshake::HandshakeResult,
    )> {
        let handshake_config = &config.handshake;
        let frame_config = FrameConfig {
            max_payload_size: handshake_config.max_handshake_payload,
            verify_checksum: config.verify_checksum,
            read_timeout: handshake_config.timeout,
            write_timeout: handshake_config.timeout,
        };

        let mut reader =
            MessageReader::with_config_device(stream.try_clone()?, frame_config.clone())?;
        let mut writer = MessageWriter::with_config_device(stream.try_clone()?, frame_config)?;

        let handshake =
            handshake_client_with_config(&mut reader, &mut writer, key_pair, handshake_config)?;

        // The reader thread blocks until the transport is shut down; stream
        // reads enforce their own deadline in the queue.
        reader.set_read_timeout(None)?;
        reader.set_max_payload_size(handshake_config.max_payload_size as usize);
        writer.set_write_timeout(config.write_timeout)?;
        writer.set_max_payload_size(handshake.max_payload_size as usize);

        Ok((reader, writer, handshake))
    }

    /// Protocol version announced by the device.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Largest payload the device accepts in one frame.
    pub fn max_payload_size(&self) -> u32 {
        self.max_payload_size
    }

    pub fn banner(&self) -> &ConnectionBanner {
        &self.banner
    }

    pub fn auth_method(&self) -> AuthMethod {
        self.auth
    }

    pub fn supports_feature(&self, feature: &str) -> bool {
        self.banner.supports_feature(feature)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Open a logical stream to `destination` (e.g. `shell:ls`, `sync:`).
    pub fn open(&self, destination: &str) -> Result<AdbStream> {
        if self.is_closed() {
            return Err(AdbError::Disconnected("connection is closed".to_string()));
        }

        let local_id = self.allocate_local_id();
        debug!(local_id, destination, "opening stream");

        if let Err(err) = self.writer.write_open(local_id, destination) {
            self.queue.stop_listening(local_id);
            return Err(err);
        }

        match self.queue.take(local_id, OKAY) {
            Ok(Delivery::Message(ack)) => {
                debug!(local_id, remote_id = ack.arg0, destination, "stream open");
                Ok(AdbStream::new(
                    local_id,
                    ack.arg0,
                    destination,
                    Arc::clone(&self.queue),
                    self.writer.clone(),
                ))
            }
            Ok(Delivery::Closed) => {
                self.queue.stop_listening(local_id);
                Err(AdbError::StreamOpenFailed(destination.to_string()))
            }
            Err(err) => {
                // The device may still answer; an acknowledgement that shows
                // up later is closed by the reader thread.
                if let Some(remote_id) = self.queue.abandon(local_id) {
                    if let Err(close_err) = self.writer.write_close(local_id, remote_id) {
                        debug!(local_id, error = %close_err, "closing abandoned stream failed");
                    }
                }
                debug!(local_id, destination, error = %err, "open failed");
                Err(err)
            }
        }
    }

    /// Open a shell v2 stream running `command`.
    pub fn open_shell(&self, command: &str) -> Result<ShellStream> {
        let stream = self.open(&format!("shell,v2,raw:{command}"))?;
        Ok(ShellStream::new(stream))
    }

    /// Run `command` to completion and collect its output.
    pub fn shell(&self, command: &str) -> Result<ShellResponse> {
        let shell = self.open_shell(command)?;
        let response = shell.read_all();
        if let Err(err) = shell.close() {
            debug!(error = %err, "closing finished shell stream failed");
        }
        response
    }

    /// Close the connection: every stream sees end of stream, the transport
    /// is shut down and the reader thread is joined. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(
            peer = ?self.transport.peer_description(),
            open_streams = self.queue.len(),
            "closing connection"
        );

        self.queue.shutdown();
        let shutdown = self.transport.shutdown();

        let handle = self
            .reader_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("reader thread panicked");
            }
        }

        shutdown.map_err(AdbError::from)
    }

    fn allocate_local_id(&self) -> u32 {
        loop {
            let id = self.next_local_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && self.queue.start_listening(id) {
                return id;
            }
        }
    }
}

impl Drop for AdbConnection {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(error = %err, "close on drop failed");
        }
    }
}

impl std::fmt::Debug for AdbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbConnection")
            .field("transport", &self.transport)
            .field("version", &format_args!("{:#010x}", self.version))
            .field("max_payload_size", &self.max_payload_size)
            .field("banner", &self.banner.as_str())
            .field("auth", &self.auth)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn shutdown_quietly(stream: &DeviceStream) {
    if let Err(err) = stream.shutdown() {
        debug!(error = %err, "transport shutdown failed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::thread;

    use std::io::Read;

    use adbmux_frame::{AUTH, AUTH_TOKEN, CLSE, CNXN, OPEN, VERSION};

    use super::*;
    use crate::emulator::{DeviceEmulator, EmulatorConfig, TestKeyPair};

    fn emulated(config: EmulatorConfig) -> (DeviceStream, thread::JoinHandle<()>) {
        let (client, device) = DeviceStream::pair().unwrap();
        let handle = thread::spawn(move || {
            let _ = DeviceEmulator::new(config).serve(device);
        });
        (client, handle)
    }

    #[test]
    fn shell_echo_end_to_end() {
        let (client, device) = emulated(EmulatorConfig::default());
        let conn = AdbConnection::connect(client, None).unwrap();

        assert!(conn.supports_feature("shell_v2"));
        let response = conn.shell("echo hi").unwrap();
        assert_eq!(response.stdout, "hi\n");
        assert_eq!(response.stderr, "");
        assert_eq!(response.exit_code, 0);

        conn.close().unwrap();
        device.join().unwrap();
    }

    #[test]
    fn signature_auth_end_to_end() {
        let key = TestKeyPair::new(b"device-trusted-key");
        let config = EmulatorConfig {
            trusted_keys: vec![key.clone()],
            ..EmulatorConfig::default()
        };
        let (client, device) = emulated(config);

        let conn = AdbConnection::connect(client, Some(&key)).unwrap();
        assert_eq!(conn.auth_method(), AuthMethod::Signature);
        assert_eq!(conn.shell("exit 7").unwrap().exit_code, 7);

        drop(conn);
        device.join().unwrap();
    }

    #[test]
    fn unknown_key_falls_back_to_public_key() {
        let config = EmulatorConfig {
            trusted_keys: vec![TestKeyPair::new(b"someone-else")],
            accept_public_key: true,
            ..EmulatorConfig::default()
        };
        let (client, device) = emulated(config);

        let key = TestKeyPair::new(b"new-key");
        let conn = AdbConnection::connect(client, Some(&key)).unwrap();
        assert_eq!(conn.auth_method(), AuthMethod::PublicKey);

        drop(conn);
        device.join().unwrap();
    }

    #[test]
    fn rejected_key_closes_transport() {
        let config = EmulatorConfig {
            trusted_keys: vec![TestKeyPair::new(b"someone-else")],
            accept_public_key: false,
            ..EmulatorConfig::default()
        };
        let (client, device) = emulated(config);
        let mut other_end = client.try_clone().unwrap();

        let key = TestKeyPair::new(b"new-key");
        let err = AdbConnection::connect(client, Some(&key)).unwrap_err();
        assert!(matches!(err, AdbError::HandshakeFailed(_)), "{err:?}");

        // Shut down on failure: reads on any clone see EOF immediately.
        let mut buf = [0u8; 1];
        assert_eq!(other_end.read(&mut buf).unwrap(), 0);
        device.join().unwrap();
    }

    #[test]
    fn missing_key_is_authentication_required() {
        let config = EmulatorConfig {
            trusted_keys: vec![TestKeyPair::new(b"k")],
            ..EmulatorConfig::default()
        };
        let (client, device) = emulated(config);

        let err = AdbConnection::connect(client, None).unwrap_err();
        assert!(matches!(err, AdbError::AuthenticationRequired));
        device.join().unwrap();
    }

    #[test]
    fn refused_open_is_stream_open_failed() {
        let (client, device) = emulated(EmulatorConfig::default());
        let conn = AdbConnection::connect(client, None).unwrap();

        let err = conn.open("no-such-service:").unwrap_err();
        assert!(matches!(err, AdbError::StreamOpenFailed(dest) if dest == "no-such-service:"));
        assert!(conn.queue.is_empty());

        drop(conn);
        device.join().unwrap();
    }

    #[test]
    fn concurrent_streams_are_isolated() {
        let (client, device) = emulated(EmulatorConfig::default());
        let conn = Arc::new(AdbConnection::connect(client, None).unwrap());

        let workers: Vec<_> = (0..4)
            .map(|n| {
                let conn = Arc::clone(&conn);
                thread::spawn(move || {
                    let stream = conn.open("echo:").unwrap();
                    let message = format!("stream {n} says hello");
                    stream.write(message.as_bytes()).unwrap();
                    let mut buf = vec![0u8; message.len()];
                    assert_eq!(stream.read_fully(&mut buf).unwrap(), message.len());
                    assert_eq!(buf, message.as_bytes());
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        conn.close().unwrap();
        device.join().unwrap();
    }

    #[test]
    fn close_wakes_blocked_readers() {
        let (client, device) = emulated(EmulatorConfig::default());
        let conn = AdbConnection::connect(client, None).unwrap();
        let stream = Arc::new(conn.open("echo:").unwrap());

        let reader = {
            let stream = Arc::clone(&stream);
            thread::spawn(move || stream.read(&mut [0u8; 16]))
        };
        thread::sleep(Duration::from_millis(50));
        conn.close().unwrap();

        assert_eq!(reader.join().unwrap().unwrap(), 0);
        assert!(matches!(conn.open("echo:"), Err(AdbError::Disconnected(_))));
        device.join().unwrap();
    }

    #[test]
    fn device_hangup_disconnects_streams() {
        let (client, device_end) = DeviceStream::pair().unwrap();
        let device = thread::spawn(move || {
            let mut reader = MessageReader::new(device_end.try_clone().unwrap());
            let mut writer = MessageWriter::new(device_end);
            assert_eq!(reader.read_message().unwrap().command, CNXN);
            writer.write_connect(VERSION, 4096, b"device::").unwrap();
            let open = reader.read_message().unwrap();
            assert_eq!(open.command, OPEN);
            writer.write_okay(9, open.arg0).unwrap();
            // Hang up with the stream open.
        });

        let conn = AdbConnection::connect(client, None).unwrap();
        let stream = conn.open("anything:").unwrap();
        device.join().unwrap();

        let err = stream.read(&mut [0u8; 4]).unwrap_err();
        assert!(matches!(err, AdbError::Disconnected(_)));
    }

    #[test]
    fn local_ids_skip_zero_and_live_ids() {
        let (client, device) = emulated(EmulatorConfig::default());
        let conn = AdbConnection::connect(client, None).unwrap();

        conn.next_local_id.store(u32::MAX, Ordering::Relaxed);
        let first = conn.open("echo:").unwrap();
        let second = conn.open("echo:").unwrap();
        assert_eq!(first.local_id(), u32::MAX);
        assert_eq!(second.local_id(), 1);

        drop((first, second));
        drop(conn);
        device.join().unwrap();
    }

    #[test]
    fn handshake_deadline_bounds_connect() {
        let (client, device_end) = DeviceStream::pair().unwrap();
        let device = thread::spawn(move || {
            let mut reader = MessageReader::new(device_end.try_clone().unwrap());
            let mut writer = MessageWriter::new(device_end);
            reader.read_message().unwrap();
            writer.write_auth(AUTH_TOKEN, b"t").unwrap();
            let signature = reader.read_message().unwrap().command;
            // Stay silent until the client gives up and hangs up.
            let after_deadline = reader.read_message();
            (signature, after_deadline.is_err())
        });

        let key = TestKeyPair::new(b"k");
        let err = AdbConnection::connect_with_config(
            client,
            Some(&key),
            &ConnectConfig {
                handshake: HandshakeConfig {
                    timeout: Some(Duration::from_millis(200)),
                    ..HandshakeConfig::default()
                },
                ..ConnectConfig::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, AdbError::Timeout(_)), "{err:?}");
        assert_eq!(device.join().unwrap(), (AUTH, true));
    }

    #[test]
    fn close_closes_live_streams() {
        let (client, device) = emulated(EmulatorConfig::default());
        let conn = AdbConnection::connect(client, None).unwrap();
        let stream = conn.open("echo:").unwrap();
        assert!(conn.queue.is_listening(stream.local_id()));

        conn.close().unwrap();

        assert!(stream.is_closed());
        assert!(!conn.queue.is_listening(stream.local_id()));
        assert!(matches!(
            stream.write(b"x"),
            Err(AdbError::StreamClosed(id)) if id == stream.local_id()
        ));
        assert_eq!(stream.read(&mut [0u8; 4]).unwrap(), 0);
        stream.close().unwrap();
        device.join().unwrap();
    }

    #[test]
    fn late_open_ack_is_closed() {
        let (client, device_end) = DeviceStream::pair().unwrap();
        let device = thread::spawn(move || {
            let mut reader = MessageReader::new(device_end.try_clone().unwrap());
            let mut writer = MessageWriter::new(device_end);
            assert_eq!(reader.read_message().unwrap().command, CNXN);
            writer.write_connect(VERSION, 4096, b"device::").unwrap();

            let open = reader.read_message().unwrap();
            assert_eq!(open.command, OPEN);
            thread::sleep(Duration::from_millis(200));
            writer.write_okay(42, open.arg0).unwrap();

            let close = reader.read_message().unwrap();
            (open.arg0, close)
        });

        let conn = AdbConnection::connect_with_config(
            client,
            None,
            &ConnectConfig {
                read_timeout: Some(Duration::from_millis(50)),
                ..ConnectConfig::default()
            },
        )
        .unwrap();
        let err = conn.open("slow:").unwrap_err();
        assert!(matches!(err, AdbError::Timeout(_)), "{err:?}");

        let (local_id, close) = device.join().unwrap();
        assert_eq!((close.command, close.arg0, close.arg1), (CLSE, local_id, 42));
        assert!(conn.queue.is_empty());
    }
}
