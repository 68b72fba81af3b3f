//! Multiplexed client for the ADB wire protocol.
//!
//! adbmux opens one authenticated connection to a device and carries many
//! independent, flow-controlled streams over it, including the shell v2
//! sub-protocol.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte transports to the device (TCP, Unix sockets)
//! - [`frame`]: 24-byte header wire framing and the command constants
//! - [`conn`]: handshake, stream multiplexing and shell v2 (behind `conn` feature)

/// Re-export transport types.
pub mod transport {
    pub use adbmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use adbmux_frame::*;
}

/// Re-export connection types (requires `conn` feature).
#[cfg(feature = "conn")]
pub mod conn {
    pub use adbmux_conn::*;
}
