//! Run one command through shell v2 and stream its output as it arrives.
//!
//! Run with:
//!   cargo run --example shell -- 192.168.1.20 getprop ro.product.model
//!
//! The device must accept connections without authentication (for example an
//! emulator or a device with `adb tcpip` enabled and the host already trusted).

use std::io::Write;

use adbmux::conn::{connect, ShellPacketId};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let addr = args.next().ok_or("usage: shell <addr> <command...>")?;
    let command = args.collect::<Vec<_>>().join(" ");
    if command.is_empty() {
        return Err("usage: shell <addr> <command...>".into());
    }

    let conn = connect(&addr, None)?;
    eprintln!("Connected: {}", conn.banner());

    let shell = conn.open_shell(&command)?;
    let mut exit_code = 0;
    while let Some(packet) = shell.read_packet()? {
        match packet.id {
            ShellPacketId::Stdout => std::io::stdout().write_all(&packet.payload)?,
            ShellPacketId::Stderr => std::io::stderr().write_all(&packet.payload)?,
            ShellPacketId::Exit => {
                exit_code = packet.exit_code().unwrap_or_default();
                break;
            }
            _ => {}
        }
    }
    std::io::stdout().flush()?;

    conn.close()?;
    eprintln!("Exit code: {exit_code}");
    std::process::exit(i32::from(exit_code));
}
