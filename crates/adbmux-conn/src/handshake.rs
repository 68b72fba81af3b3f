use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use adbmux_frame::{
    command_name, FrameError, Message, MessageReader, MessageWriter, AUTH, AUTH_RSAPUBLICKEY,
    AUTH_SIGNATURE, AUTH_TOKEN, CNXN, CONNECT_IDENTITY, MAX_PAYLOAD, VERSION,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::banner::ConnectionBanner;
use crate::error::{AdbError, Result};
use crate::keypair::AdbKeyPair;

/// Where the client is in the CNXN/AUTH exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// CNXN not sent yet.
    Start,
    /// CNXN sent; the device answers with CNXN or an AUTH challenge.
    AwaitingAuthOrConnect,
    /// Signed token sent.
    AwaitingConnectAfterSignature,
    /// Public key sent; only CNXN is acceptable now.
    AwaitingConnectAfterPublicKey,
    Connected,
    Failed,
}

/// How the device accepted the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// The device did not ask for authentication.
    None,
    /// The device accepted the signed token.
    Signature,
    /// The device accepted the public key (usually after a user prompt).
    PublicKey,
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Protocol version announced by the device.
    pub version: u32,
    /// Largest payload the device accepts; outbound writes are chunked to it.
    pub max_payload_size: u32,
    pub banner: ConnectionBanner,
    pub auth: AuthMethod,
}

/// Configuration for the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Deadline for the whole exchange. `None` waits indefinitely, which is
    /// what a device showing an authorization prompt may need.
    pub timeout: Option<Duration>,
    /// Maximum payload accepted from the device before the handshake completes.
    pub max_handshake_payload: usize,
    /// Protocol version announced in our CNXN.
    pub version: u32,
    /// Maximum payload announced in our CNXN.
    pub max_payload_size: u32,
    /// System identity string sent in our CNXN, NUL-terminated.
    pub identity: Vec<u8>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            max_handshake_payload: 16 * 1024,
            version: VERSION,
            max_payload_size: MAX_PAYLOAD,
            identity: CONNECT_IDENTITY.to_vec(),
        }
    }
}

/// What the client has to do after feeding one message to the state machine.
#[derive(Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Send an AUTH message and keep waiting.
    Auth { auth_type: u32, payload: Vec<u8> },
    /// The device sent CNXN.
    Connected(HandshakeResult),
}

impl fmt::Debug for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth { auth_type, payload } => f
                .debug_struct("Auth")
                .field("auth_type", auth_type)
                .field(
                    "payload",
                    &format_args!("<redacted:{} bytes>", payload.len()),
                )
                .finish(),
            Self::Connected(result) => f.debug_tuple("Connected").field(result).finish(),
        }
    }
}

/// Client side of the handshake as a pure state machine.
///
/// It never touches I/O: the caller sends our CNXN, calls [`begin`], then
/// feeds each received message to [`advance`] and sends whatever it asks for.
///
/// [`begin`]: ClientHandshake::begin
/// [`advance`]: ClientHandshake::advance
pub struct ClientHandshake<'k> {
    state: HandshakeState,
    key_pair: Option<&'k dyn AdbKeyPair>,
}

impl<'k> ClientHandshake<'k> {
    pub fn new(key_pair: Option<&'k dyn AdbKeyPair>) -> Self {
        Self {
            state: HandshakeState::Start,
            key_pair,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Record that our CNXN has been sent.
    pub fn begin(&mut self) {
        if self.state == HandshakeState::Start {
            self.state = HandshakeState::AwaitingAuthOrConnect;
        }
    }

    /// Feed one message from the device. Any error moves the machine to
    /// [`HandshakeState::Failed`] and it stays there.
    pub fn advance(&mut self, message: &Message) -> Result<HandshakeStep> {
        let step = self.transition(message);
        match &step {
            Ok(HandshakeStep::Connected(_)) => self.state = HandshakeState::Connected,
            Ok(HandshakeStep::Auth { .. }) => {}
            Err(_) => self.state = HandshakeState::Failed,
        }
        step
    }

    fn transition(&mut self, message: &Message) -> Result<HandshakeStep> {
        use HandshakeState::*;

        match (self.state, message.command) {
            (AwaitingAuthOrConnect, CNXN) => connected(message, AuthMethod::None),
            (AwaitingConnectAfterSignature, CNXN) => connected(message, AuthMethod::Signature),
            (AwaitingConnectAfterPublicKey, CNXN) => connected(message, AuthMethod::PublicKey),
            (AwaitingAuthOrConnect, AUTH) => {
                expect_token(message)?;
                let key_pair = self.key_pair.ok_or(AdbError::AuthenticationRequired)?;
                debug!(
                    token_len = message.payload.len(),
                    "device requested authentication, signing token"
                );
                let signature = key_pair.sign(&message.payload)?;
                self.state = AwaitingConnectAfterSignature;
                Ok(HandshakeStep::Auth {
                    auth_type: AUTH_SIGNATURE,
                    payload: signature,
                })
            }
            (AwaitingConnectAfterSignature, AUTH) => {
                expect_token(message)?;
                let key_pair = self.key_pair.ok_or(AdbError::AuthenticationRequired)?;
                debug!("device rejected signature, sending public key");
                self.state = AwaitingConnectAfterPublicKey;
                Ok(HandshakeStep::Auth {
                    auth_type: AUTH_RSAPUBLICKEY,
                    payload: key_pair.public_key_bytes(),
                })
            }
            (AwaitingConnectAfterPublicKey, command) => Err(AdbError::HandshakeFailed(format!(
                "device did not accept the public key (got {})",
                command_name(command)
            ))),
            (Start, _) => Err(AdbError::HandshakeFailed(
                "message received before CNXN was sent".to_string(),
            )),
            (Connected | Failed, _) => Err(AdbError::HandshakeFailed(
                "handshake already finished".to_string(),
            )),
            (_, command) => Err(AdbError::HandshakeFailed(format!(
                "unexpected {} during handshake",
                command_name(command)
            ))),
        }
    }
}

impl fmt::Debug for ClientHandshake<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandshake")
            .field("state", &self.state)
            .field(
                "key_pair",
                &self.key_pair.map(|_| "<redacted>"),
            )
            .finish()
    }
}

fn expect_token(message: &Message) -> Result<()> {
    if message.arg0 != AUTH_TOKEN {
        return Err(AdbError::HandshakeFailed(format!(
            "unsupported AUTH type {}",
            message.arg0
        )));
    }
    Ok(())
}

fn connected(message: &Message, auth: AuthMethod) -> Result<HandshakeStep> {
    if message.arg1 == 0 {
        return Err(AdbError::HandshakeFailed(
            "device announced a max payload of 0".to_string(),
        ));
    }
    Ok(HandshakeStep::Connected(HandshakeResult {
        version: message.arg0,
        max_payload_size: message.arg1,
        banner: ConnectionBanner::parse(&message.payload),
        auth,
    }))
}

/// Perform the client handshake using default configuration.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    key_pair: Option<&dyn AdbKeyPair>,
) -> Result<HandshakeResult> {
    handshake_client_with_config(reader, writer, key_pair, &HandshakeConfig::default())
}

/// Perform the client handshake using explicit configuration.
///
/// The caller owns the transport and must shut it down if this fails.
pub fn handshake_client_with_config<R: Read, W: Write>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    key_pair: Option<&dyn AdbKeyPair>,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    let mut machine = ClientHandshake::new(key_pair);

    debug!(
        version = config.version,
        max_payload = config.max_payload_size,
        "sending CNXN"
    );
    writer.write_connect(config.version, config.max_payload_size, &config.identity)?;
    machine.begin();

    let deadline = config.timeout.map(|timeout| Instant::now() + timeout);
    loop {
        let message = recv_handshake_message(reader, deadline, config)?;
        match machine.advance(&message)? {
            HandshakeStep::Auth { auth_type, payload } => {
                writer.write_auth(auth_type, &payload)?;
            }
            HandshakeStep::Connected(result) => {
                info!(
                    version = result.version,
                    max_payload = result.max_payload_size,
                    auth = ?result.auth,
                    banner = %result.banner,
                    "handshake complete"
                );
                return Ok(result);
            }
        }
    }
}

fn recv_handshake_message<R: Read>(
    reader: &mut MessageReader<R>,
    deadline: Option<Instant>,
    config: &HandshakeConfig,
) -> Result<Message> {
    loop {
        if let (Some(deadline), Some(timeout)) = (deadline, config.timeout) {
            if Instant::now() >= deadline {
                return Err(AdbError::Timeout(timeout));
            }
        }

        match reader.read_message() {
            Ok(message) => {
                if message.payload.len() > config.max_handshake_payload {
                    return Err(AdbError::HandshakeFailed(format!(
                        "handshake payload too large: {} (max {})",
                        message.payload.len(),
                        config.max_handshake_payload
                    )));
                }
                return Ok(message);
            }
            Err(FrameError::Io(err))
                if deadline.is_some()
                    && (err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                return Err(AdbError::Disconnected(
                    "connection closed during handshake".to_string(),
                ));
            }
            Err(err) => return Err(AdbError::Frame(err)),
        }
    }
}
