use std::fmt;
use std::io;

use adbmux_conn::AdbError;
use adbmux_frame::FrameError;
use adbmux_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotFound
        | io::ErrorKind::UnexpectedEof => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Connect { source, .. } | TransportError::Io(source) => {
            io_error(context, source)
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::ConnectionClosed => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn adb_error(context: &str, err: AdbError) -> CliError {
    match err {
        AdbError::Transport(err) => transport_error(context, err),
        AdbError::Frame(err) => frame_error(context, err),
        AdbError::AuthenticationRequired | AdbError::Signing(_) => {
            CliError::new(PERMISSION_DENIED, format!("{context}: {err}"))
        }
        AdbError::Protocol(_) | AdbError::HandshakeFailed(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        AdbError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        AdbError::Disconnected(_) => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        AdbError::StreamOpenFailed(_) | AdbError::StreamClosed(_) => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn maps_refused_connect_to_transport_code() {
        let err = AdbError::Transport(TransportError::Connect {
            addr: "127.0.0.1:5555".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        });
        let mapped = adb_error("connect failed", err);
        assert_eq!(mapped.code, TRANSPORT_ERROR);
        assert!(mapped.message.starts_with("connect failed: "));
    }

    #[test]
    fn maps_auth_and_protocol_errors() {
        assert_eq!(
            adb_error("x", AdbError::AuthenticationRequired).code,
            PERMISSION_DENIED
        );
        assert_eq!(
            adb_error("x", AdbError::Protocol("bad shell packet".into())).code,
            DATA_INVALID
        );
        assert_eq!(
            adb_error(
                "x",
                AdbError::Frame(FrameError::ChecksumMismatch {
                    expected: 1,
                    actual: 2
                })
            )
            .code,
            DATA_INVALID
        );
    }

    #[test]
    fn maps_timeouts() {
        assert_eq!(
            adb_error("x", AdbError::Timeout(Duration::from_secs(1))).code,
            TIMEOUT
        );
        let err = AdbError::Frame(FrameError::Io(io::Error::from(io::ErrorKind::TimedOut)));
        assert_eq!(adb_error("x", err).code, TIMEOUT);
    }
}
