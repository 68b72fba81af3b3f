//! An in-process device for tests.
//!
//! [`DeviceEmulator`] speaks the device side of the protocol over any
//! [`DeviceStream`]: the CNXN/AUTH handshake (optionally requiring a trusted
//! [`TestKeyPair`]), OPEN/OKAY/WRTE/CLSE with one-frame-in-flight flow
//! control, an `echo:` service and a tiny shell v2 service understanding
//! `echo`, `exit`, `seq`, `error` and `cat`.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::thread::JoinHandle;

use adbmux_frame::{
    command_name, FrameError, Message, MessageReader, MessageWriter, AUTH, AUTH_RSAPUBLICKEY,
    AUTH_SIGNATURE, AUTH_TOKEN, CLSE, CNXN, OKAY, OPEN, VERSION, WRTE,
};
use adbmux_transport::{DeviceStream, TransportError};
use tracing::{debug, trace};

use crate::error::{AdbError, Result};
use crate::keypair::{AdbKeyPair, SignError};
use crate::shell::{
    SHELL_HEADER_SIZE, SHELL_ID_CLOSE_STDIN, SHELL_ID_EXIT, SHELL_ID_STDERR, SHELL_ID_STDIN,
    SHELL_ID_STDOUT,
};

/// Key pair whose "signature" is the token XORed with a secret.
///
/// Only meaningful against [`DeviceEmulator`]; it exercises the handshake
/// paths without real cryptography.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestKeyPair {
    secret: Vec<u8>,
}

impl TestKeyPair {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    fn signature_for(&self, token: &[u8]) -> Vec<u8> {
        if self.secret.is_empty() {
            return token.to_vec();
        }
        token
            .iter()
            .zip(self.secret.iter().cycle())
            .map(|(t, s)| t ^ s)
            .collect()
    }
}

impl AdbKeyPair for TestKeyPair {
    fn sign(&self, token: &[u8]) -> std::result::Result<Vec<u8>, SignError> {
        Ok(self.signature_for(token))
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        let hex: String = self.secret.iter().map(|b| format!("{b:02x}")).collect();
        format!("{hex} adbmux-test\0").into_bytes()
    }
}

/// Emulated device settings.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// CNXN payload, without the trailing NUL.
    pub banner: String,
    pub version: u32,
    pub max_payload_size: u32,
    /// Keys whose signatures are accepted. Empty means no authentication.
    pub trusted_keys: Vec<TestKeyPair>,
    /// Accept any public key offered after a rejected signature.
    pub accept_public_key: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            banner: "device::ro.product.name=adbmux_emu;ro.product.model=Emulator;\
                     ro.product.device=emu;features=shell_v2,cmd"
                .to_string(),
            version: VERSION,
            max_payload_size: 4096,
            trusted_keys: Vec::new(),
            accept_public_key: false,
        }
    }
}

enum Service {
    Echo,
    Shell { stdin: Vec<u8>, cat: bool },
}

struct EmulatedStream {
    client_id: u32,
    service: Service,
    outbox: VecDeque<Vec<u8>>,
    awaiting_ack: bool,
    close_when_drained: bool,
}

/// Device side of one connection.
pub struct DeviceEmulator {
    config: EmulatorConfig,
    chunk_size: usize,
    streams: HashMap<u32, EmulatedStream>,
    next_id: u32,
    tokens_sent: u32,
}

impl DeviceEmulator {
    pub fn new(config: EmulatorConfig) -> Self {
        let chunk_size = config.max_payload_size.max(1) as usize;
        Self {
            config,
            chunk_size,
            streams: HashMap::new(),
            next_id: 1000,
            tokens_sent: 0,
        }
    }

    /// Bind a loopback listener and serve the first connection on a thread.
    pub fn listen_tcp(self) -> std::io::Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let handle = std::thread::Builder::new()
            .name("adbmux-emulator".to_string())
            .spawn(move || {
                let (socket, peer) = listener.accept().map_err(TransportError::from)?;
                debug!(%peer, "emulator accepted connection");
                self.serve(DeviceStream::from_tcp(socket))
            })?;
        Ok((addr, handle))
    }

    /// Serve one client until it disconnects.
    pub fn serve(mut self, stream: DeviceStream) -> Result<()> {
        let mut reader = MessageReader::new(stream.try_clone()?);
        let mut writer = MessageWriter::new(stream);

        let Some(connect) = next_message(&mut reader)? else {
            return Ok(());
        };
        if connect.command != CNXN {
            return Err(AdbError::Protocol(format!(
                "expected CNXN, got {}",
                connect.command_name()
            )));
        }
        self.chunk_size = self.chunk_size.min(connect.arg1.max(1) as usize);

        if !self.config.trusted_keys.is_empty() && !self.authenticate(&mut reader, &mut writer)? {
            return Ok(());
        }

        let mut banner = self.config.banner.clone().into_bytes();
        banner.push(0);
        writer.write_connect(self.config.version, self.config.max_payload_size, &banner)?;
        debug!("emulator connected");

        while let Some(message) = next_message(&mut reader)? {
            match message.command {
                OPEN => self.on_open(&mut writer, &message)?,
                WRTE => self.on_write(&mut writer, &message)?,
                OKAY => self.on_okay(&mut writer, &message)?,
                CLSE => {
                    trace!(device_id = message.arg1, "client closed stream");
                    self.streams.remove(&message.arg1);
                }
                other => debug!(command = command_name(other), "emulator ignoring message"),
            }
        }
        Ok(())
    }

    /// Challenge until the client signs with a trusted key or offers a
    /// public key we accept. Returns `false` if the client went away.
    fn authenticate(
        &mut self,
        reader: &mut MessageReader<DeviceStream>,
        writer: &mut MessageWriter<DeviceStream>,
    ) -> Result<bool> {
        loop {
            self.tokens_sent += 1;
            let token = format!("adbmux-token-{:07}", self.tokens_sent).into_bytes();
            writer.write_auth(AUTH_TOKEN, &token)?;

            let Some(reply) = next_message(reader)? else {
                return Ok(false);
            };
            match (reply.command, reply.arg0) {
                (AUTH, AUTH_SIGNATURE) => {
                    let trusted = self
                        .config
                        .trusted_keys
                        .iter()
                        .any(|key| key.signature_for(&token) == reply.payload.as_ref());
                    if trusted {
                        return Ok(true);
                    }
                }
                (AUTH, AUTH_RSAPUBLICKEY) if self.config.accept_public_key => return Ok(true),
                (AUTH, AUTH_RSAPUBLICKEY) => {}
                (command, _) => {
                    return Err(AdbError::Protocol(format!(
                        "unexpected {} during authentication",
                        command_name(command)
                    )))
                }
            }
        }
    }

    fn on_open(&mut self, writer: &mut MessageWriter<DeviceStream>, message: &Message) -> Result<()> {
        let client_id = message.arg0;
        let destination = String::from_utf8_lossy(&message.payload)
            .trim_end_matches('\0')
            .to_string();

        let command = destination
            .strip_prefix("shell,v2,raw:")
            .or_else(|| destination.strip_prefix("shell,v2:"));
        let service = match (destination.as_str(), command) {
            ("echo:", _) => Service::Echo,
            (_, Some(command)) => Service::Shell {
                stdin: Vec::new(),
                cat: command.trim() == "cat",
            },
            _ => {
                debug!(%destination, "emulator refusing stream");
                writer.write_close(0, client_id)?;
                return Ok(());
            }
        };

        let device_id = self.next_id;
        self.next_id += 1;
        writer.write_okay(device_id, client_id)?;
        self.streams.insert(
            device_id,
            EmulatedStream {
                client_id,
                service,
                outbox: VecDeque::new(),
                awaiting_ack: false,
                close_when_drained: false,
            },
        );

        if let Some(command) = command {
            if command.trim() != "cat" {
                let (output, exit_code) = run_command(command);
                let mut bytes = output;
                bytes.extend(shell_packet(SHELL_ID_EXIT, &[exit_code]));
                self.send(writer, device_id, &bytes, true)?;
            }
        }
        Ok(())
    }

    fn on_write(&mut self, writer: &mut MessageWriter<DeviceStream>, message: &Message) -> Result<()> {
        let device_id = message.arg1;
        let Some(stream) = self.streams.get_mut(&device_id) else {
            return Ok(());
        };
        writer.write_okay(device_id, stream.client_id)?;

        let mut reply = Vec::new();
        let mut finished = false;
        match &mut stream.service {
            Service::Echo => reply.extend_from_slice(&message.payload),
            Service::Shell { stdin, cat } => {
                stdin.extend_from_slice(&message.payload);
                while let Some((id, payload)) = take_shell_packet(stdin) {
                    match id {
                        SHELL_ID_STDIN if *cat => {
                            reply.extend(shell_packet(SHELL_ID_STDOUT, &payload));
                        }
                        SHELL_ID_CLOSE_STDIN if *cat => {
                            reply.extend(shell_packet(SHELL_ID_EXIT, &[0]));
                            finished = true;
                        }
                        _ => {}
                    }
                }
            }
        }

        if reply.is_empty() {
            return Ok(());
        }
        self.send(writer, device_id, &reply, finished)
    }

    fn on_okay(&mut self, writer: &mut MessageWriter<DeviceStream>, message: &Message) -> Result<()> {
        let device_id = message.arg1;
        if let Some(stream) = self.streams.get_mut(&device_id) {
            stream.awaiting_ack = false;
        }
        self.pump(writer, device_id)
    }

    fn send(
        &mut self,
        writer: &mut MessageWriter<DeviceStream>,
        device_id: u32,
        bytes: &[u8],
        close_after: bool,
    ) -> Result<()> {
        let chunk_size = self.chunk_size;
        if let Some(stream) = self.streams.get_mut(&device_id) {
            stream
                .outbox
                .extend(bytes.chunks(chunk_size).map(<[u8]>::to_vec));
            stream.close_when_drained |= close_after;
        }
        self.pump(writer, device_id)
    }

    /// Send the next queued frame if the client has acknowledged the last one.
    fn pump(&mut self, writer: &mut MessageWriter<DeviceStream>, device_id: u32) -> Result<()> {
        let Some(stream) = self.streams.get_mut(&device_id) else {
            return Ok(());
        };
        if stream.awaiting_ack {
            return Ok(());
        }
        if let Some(chunk) = stream.outbox.pop_front() {
            writer.write_write(device_id, stream.client_id, &chunk)?;
            stream.awaiting_ack = true;
        } else if stream.close_when_drained {
            writer.write_close(device_id, stream.client_id)?;
            self.streams.remove(&device_id);
        }
        Ok(())
    }
}

fn next_message(reader: &mut MessageReader<DeviceStream>) -> Result<Option<Message>> {
    match reader.read_message() {
        Ok(message) => Ok(Some(message)),
        Err(FrameError::ConnectionClosed) => Ok(None),
        Err(FrameError::Io(err))
            if matches!(
                err.kind(),
                ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
            ) =>
        {
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn shell_packet(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SHELL_HEADER_SIZE + payload.len());
    out.push(id);
    out.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn take_shell_packet(buf: &mut Vec<u8>) -> Option<(u8, Vec<u8>)> {
    if buf.len() < SHELL_HEADER_SIZE {
        return None;
    }
    let len = i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]).max(0) as usize;
    if buf.len() < SHELL_HEADER_SIZE + len {
        return None;
    }
    let id = buf[0];
    let payload = buf[SHELL_HEADER_SIZE..SHELL_HEADER_SIZE + len].to_vec();
    buf.drain(..SHELL_HEADER_SIZE + len);
    Some((id, payload))
}

/// Output packets and exit status of a non-interactive command.
fn run_command(command: &str) -> (Vec<u8>, u8) {
    let mut words = command.split_whitespace();
    let program = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();

    match program {
        "echo" => {
            let line = format!("{}\n", args.join(" "));
            (shell_packet(SHELL_ID_STDOUT, line.as_bytes()), 0)
        }
        "exit" => {
            let code = args.first().and_then(|c| c.parse().ok()).unwrap_or(0);
            (Vec::new(), code)
        }
        "seq" => {
            let count: u32 = args.first().and_then(|c| c.parse().ok()).unwrap_or(0);
            let text: String = (1..=count).map(|n| format!("{n}\n")).collect();
            (shell_packet(SHELL_ID_STDOUT, text.as_bytes()), 0)
        }
        "error" => {
            let line = format!("{}\n", args.join(" "));
            (shell_packet(SHELL_ID_STDERR, line.as_bytes()), 1)
        }
        "" => (Vec::new(), 0),
        other => {
            let line = format!("{other}: not found\n");
            (shell_packet(SHELL_ID_STDERR, line.as_bytes()), 127)
        }
    }
}
