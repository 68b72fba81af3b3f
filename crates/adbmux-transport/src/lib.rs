//! Byte transport for adbmux.
//!
//! The protocol layers above only need an ordered, reliable, bidirectional
//! byte connection that can be cloned (one handle for the reader thread, one
//! for the writer) and shut down from any thread. [`DeviceStream`] provides
//! that over:
//! - TCP (`adbd` listening on a network port, the emulator console port)
//! - Unix domain sockets (local forwards, in-process test pairs)

pub mod error;
pub mod tcp;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use tcp::{connect_tcp, DEFAULT_ADB_PORT};
pub use traits::DeviceStream;

#[cfg(unix)]
pub use uds::connect_unix;
