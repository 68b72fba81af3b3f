use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::DeviceStream;

/// Port `adbd` listens on when TCP debugging is enabled.
pub const DEFAULT_ADB_PORT: u16 = 5555;

/// Connect to a device over TCP (blocking).
///
/// Every resolved address is tried in order; the error of the last attempt
/// is returned if none accepts. With `timeout` set, each attempt is bounded.
/// Nagle is disabled since the protocol sends many small control frames.
pub fn connect_tcp(
    addr: impl ToSocketAddrs + std::fmt::Display,
    timeout: Option<Duration>,
) -> Result<DeviceStream> {
    let label = addr.to_string();
    let candidates = addr.to_socket_addrs().map_err(|e| TransportError::Connect {
        addr: label.clone(),
        source: e,
    })?;

    let mut last_err = None;
    for candidate in candidates {
        debug!(addr = %candidate, "connecting");
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&candidate, timeout),
            None => TcpStream::connect(candidate),
        };
        match attempt {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                info!(addr = %candidate, "connected to device");
                return Ok(DeviceStream::from_tcp(stream));
            }
            Err(err) => last_err = Some(err),
        }
    }

    match last_err {
        Some(source) => Err(TransportError::Connect {
            addr: label,
            source,
        }),
        None => Err(TransportError::Unresolved(label)),
    }
}
