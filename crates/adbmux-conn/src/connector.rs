use adbmux_transport::{connect_tcp, DEFAULT_ADB_PORT};
#[cfg(unix)]
use std::path::Path;

use crate::connection::{AdbConnection, ConnectConfig};
use crate::error::Result;
use crate::keypair::AdbKeyPair;

/// Connect to a device over TCP. `addr` may omit the port (5555).
pub fn connect(addr: &str, key_pair: Option<&dyn AdbKeyPair>) -> Result<AdbConnection> {
    connect_with_config(addr, key_pair, &ConnectConfig::default())
}

/// Connect over TCP with explicit configuration.
pub fn connect_with_config(
    addr: &str,
    key_pair: Option<&dyn AdbKeyPair>,
    config: &ConnectConfig,
) -> Result<AdbConnection> {
    let stream = connect_tcp(with_default_port(addr), config.connect_timeout)?;
    AdbConnection::connect_with_config(stream, key_pair, config)
}

/// Connect through a Unix domain socket (an emulator bridge or a forwarded
/// socket) with explicit configuration.
#[cfg(unix)]
pub fn connect_unix_with_config(
    path: impl AsRef<Path>,
    key_pair: Option<&dyn AdbKeyPair>,
    config: &ConnectConfig,
) -> Result<AdbConnection> {
    let stream = adbmux_transport::connect_unix(path)?;
    AdbConnection::connect_with_config(stream, key_pair, config)
}

/// Append the default ADB port unless `addr` already names one.
pub fn with_default_port(addr: &str) -> String {
    if addr.parse::<std::net::SocketAddr>().is_ok() {
        return addr.to_string();
    }
    // Bare IPv6 literal.
    if addr.parse::<std::net::Ipv6Addr>().is_ok() {
        return format!("[{addr}]:{DEFAULT_ADB_PORT}");
    }
    match addr.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => addr.to_string(),
        _ => format!("{addr}:{DEFAULT_ADB_PORT}"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::emulator::{DeviceEmulator, EmulatorConfig};
    use crate::error::AdbError;

    #[test]
    fn default_port_is_appended() {
        assert_eq!(with_default_port("192.168.1.20"), "192.168.1.20:5555");
        assert_eq!(with_default_port("192.168.1.20:4444"), "192.168.1.20:4444");
        assert_eq!(with_default_port("phone.local"), "phone.local:5555");
        assert_eq!(with_default_port("phone.local:37000"), "phone.local:37000");
        assert_eq!(with_default_port("::1"), "[::1]:5555");
        assert_eq!(with_default_port("[::1]:5037"), "[::1]:5037");
    }

    #[test]
    fn connect_over_tcp() {
        let (addr, device) = DeviceEmulator::new(EmulatorConfig::default())
            .listen_tcp()
            .unwrap();

        let conn = connect(&addr.to_string(), None).unwrap();
        assert_eq!(conn.banner().kind(), "device");
        assert_eq!(conn.max_payload_size(), 4096);

        let response = conn.shell("seq 2000").unwrap();
        assert_eq!(response.stdout.lines().count(), 2000);
        assert_eq!(response.stdout.lines().last(), Some("2000"));

        drop(conn);
        device.join().unwrap().unwrap();
    }

    #[test]
    fn connect_refused_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ConnectConfig {
            connect_timeout: Some(Duration::from_millis(500)),
            ..ConnectConfig::default()
        };
        let err = connect_with_config(&addr.to_string(), None, &config).unwrap_err();
        assert!(matches!(err, AdbError::Transport(_)));
    }

    #[cfg(unix)]
    #[test]
    fn connect_over_unix_socket() {
        let dir = std::env::temp_dir().join(format!(
            "adbmux-conn-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let sock_path = dir.join("device.sock");
        let listener = std::os::unix::net::UnixListener::bind(&sock_path).unwrap();

        let device = std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            DeviceEmulator::new(EmulatorConfig::default())
                .serve(adbmux_transport::DeviceStream::from_unix(socket))
        });

        let conn = connect_unix_with_config(&sock_path, None, &ConnectConfig::default()).unwrap();
        assert_eq!(conn.shell("echo over unix").unwrap().stdout, "over unix\n");

        drop(conn);
        device.join().unwrap().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
