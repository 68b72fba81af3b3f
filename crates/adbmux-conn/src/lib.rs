//! Client side of the ADB wire protocol.
//!
//! Connect to a device, authenticate, then open any number of logical
//! streams over the one connection. A single reader thread fans inbound
//! messages out to the streams; writes from all streams are serialised
//! through one shared writer.
//!
//! ```no_run
//! let conn = adbmux_conn::connect("192.168.1.20:5555", None)?;
//! let response = conn.shell("getprop ro.product.model")?;
//! print!("{}", response.stdout);
//! # Ok::<(), adbmux_conn::AdbError>(())
//! ```

pub mod banner;
pub mod connection;
pub mod connector;
#[cfg(any(test, feature = "emulator"))]
pub mod emulator;
pub mod error;
pub mod handshake;
pub mod keypair;
pub mod queue;
pub mod shell;
pub mod stream;
pub mod writer;

pub use banner::ConnectionBanner;
pub use connection::{AdbConnection, ConnectConfig};
#[cfg(unix)]
pub use connector::connect_unix_with_config;
pub use connector::{connect, connect_with_config, with_default_port};
pub use error::{AdbError, Result};
pub use handshake::{
    handshake_client, handshake_client_with_config, AuthMethod, ClientHandshake, HandshakeConfig,
    HandshakeResult, HandshakeState, HandshakeStep,
};
pub use keypair::{AdbKeyPair, SignError};
pub use queue::{Delivery, MessageQueue};
pub use shell::{ShellPacket, ShellPacketId, ShellResponse, ShellStream};
pub use stream::AdbStream;
pub use writer::SharedWriter;
