use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("adbmux {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: adbmux");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "build_target: {}",
        option_env!("ADBMUX_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("adb_version: 0x{:08x}", adbmux_frame::VERSION);
    println!("max_payload: {}", adbmux_frame::MAX_PAYLOAD);
    println!(
        "features: conn={}, async={}, emulator={}, cli=true",
        cfg!(feature = "conn"),
        cfg!(feature = "async"),
        cfg!(feature = "emulator")
    );

    Ok(SUCCESS)
}
