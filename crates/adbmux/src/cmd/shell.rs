use tracing::debug;

use crate::cmd::{connect_device, parse_timeout, ShellArgs};
use crate::exit::{adb_error, CliError, CliResult, USAGE};
use crate::output::{print_shell, OutputFormat};

pub fn run(args: ShellArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;
    let read_timeout = args.read_timeout.as_deref().map(parse_timeout).transpose()?;

    let command = args.command.join(" ");
    if command.trim().is_empty() {
        return Err(CliError::new(USAGE, "shell command must not be empty"));
    }

    let conn = connect_device(&args.addr, timeout, read_timeout)?;
    if !conn.supports_feature("shell_v2") {
        debug!(addr = %args.addr, "device does not advertise shell_v2");
    }

    let response = conn
        .shell(&command)
        .map_err(|err| adb_error("shell failed", err))?;
    let _ = conn.close();

    print_shell(&args.addr, &command, &response, format);
    Ok(i32::from(response.exit_code))
}
