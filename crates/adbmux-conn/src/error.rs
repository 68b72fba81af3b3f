use std::time::Duration;

/// Errors that can occur on a connection or one of its streams.
#[derive(Debug, thiserror::Error)]
pub enum AdbError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] adbmux_transport::TransportError),

    /// Frame-level error (malformed header, oversized payload, I/O).
    #[error("frame error: {0}")]
    Frame(#[from] adbmux_frame::FrameError),

    /// The peer violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The device asked for authentication and no key pair was configured.
    #[error("authentication required but no key pair was provided")]
    AuthenticationRequired,

    /// The handshake did not reach a connected state.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The key pair could not sign the device's challenge.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The device refused to open a stream.
    #[error("failed to open stream to '{0}'")]
    StreamOpenFailed(String),

    /// Write on a stream that has already been closed.
    #[error("stream {0} is closed")]
    StreamClosed(u32),

    /// The connection's reader stopped; no more data will arrive.
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// A configured deadline expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<AdbError> for std::io::Error {
    fn from(err: AdbError) -> Self {
        use std::io::ErrorKind;

        match err {
            AdbError::Transport(adbmux_transport::TransportError::Io(io))
            | AdbError::Frame(adbmux_frame::FrameError::Io(io)) => io,
            AdbError::Timeout(_) => std::io::Error::new(ErrorKind::TimedOut, err),
            AdbError::StreamClosed(_) => std::io::Error::new(ErrorKind::BrokenPipe, err),
            AdbError::Disconnected(_) => std::io::Error::new(ErrorKind::ConnectionAborted, err),
            AdbError::Protocol(_) | AdbError::Frame(_) => {
                std::io::Error::new(ErrorKind::InvalidData, err)
            }
            other => std::io::Error::other(other),
        }
    }
}

impl From<crate::keypair::SignError> for AdbError {
    fn from(err: crate::keypair::SignError) -> Self {
        Self::Signing(err.0)
    }
}

pub type Result<T> = std::result::Result<T, AdbError>;
