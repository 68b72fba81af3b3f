use std::time::Duration;

use adbmux_conn::{AdbConnection, ConnectConfig, HandshakeConfig};
use clap::{Args, Subcommand};

use crate::exit::{adb_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod info;
pub mod shell;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command through the shell v2 service and exit with its status.
    Shell(ShellArgs),
    /// Connect to a device and print the negotiated connection metadata.
    Info(InfoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: Option<OutputFormat>) -> CliResult<i32> {
    match command {
        Command::Shell(args) => shell::run(args, format.unwrap_or(OutputFormat::Raw)),
        Command::Info(args) => info::run(
            args,
            format.unwrap_or_else(OutputFormat::default_for_stdout),
        ),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ShellArgs {
    /// Device address (host[:port], default port 5555).
    pub addr: String,
    /// Connect and handshake timeout (e.g. 10s, 500ms).
    #[arg(long, default_value = "10s")]
    pub timeout: String,
    /// Give up when the device sends nothing for this long (e.g. 30s).
    #[arg(long, value_name = "DURATION")]
    pub read_timeout: Option<String>,
    /// Command line to run on the device.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Device address (host[:port], default port 5555).
    pub addr: String,
    /// Connect and handshake timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Connect without a key pair; devices that demand authentication are
/// reported as permission failures.
pub(crate) fn connect_device(
    addr: &str,
    timeout: Duration,
    read_timeout: Option<Duration>,
) -> CliResult<AdbConnection> {
    let config = ConnectConfig {
        handshake: HandshakeConfig {
            timeout: Some(timeout),
            ..HandshakeConfig::default()
        },
        connect_timeout: Some(timeout),
        read_timeout,
        ..ConnectConfig::default()
    };
    adbmux_conn::connect_with_config(addr, None, &config)
        .map_err(|err| adb_error(&format!("connect to {addr} failed"), err))
}

pub(crate) fn parse_timeout(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "timeout must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid timeout value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "timeout must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
