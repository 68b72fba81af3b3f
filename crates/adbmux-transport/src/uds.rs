use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::DeviceStream;

/// Connect to a device endpoint exposed as a Unix domain socket (blocking).
///
/// Used for local forwards of a device's transport and for emulators that
/// publish a socket path instead of a TCP port.
pub fn connect_unix(path: impl AsRef<Path>) -> Result<DeviceStream> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
        addr: path.display().to_string(),
        source: e,
    })?;
    debug!(?path, "connected to unix domain socket");
    Ok(DeviceStream::from_unix(stream))
}
