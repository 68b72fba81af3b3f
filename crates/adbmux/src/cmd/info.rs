use std::collections::BTreeMap;

use adbmux_conn::{AdbConnection, AuthMethod};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use crate::cmd::{connect_device, parse_timeout, InfoArgs};
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_json, OutputFormat};

#[derive(Serialize)]
struct InfoOutput<'a> {
    address: &'a str,
    protocol_version: String,
    max_payload_size: u32,
    auth: AuthMethod,
    kind: &'a str,
    serial: &'a str,
    properties: &'a BTreeMap<String, String>,
    features: Vec<&'a str>,
    banner: &'a str,
}

impl<'a> InfoOutput<'a> {
    fn new(address: &'a str, conn: &'a AdbConnection) -> Self {
        let banner = conn.banner();
        Self {
            address,
            protocol_version: format!("0x{:08x}", conn.version()),
            max_payload_size: conn.max_payload_size(),
            auth: conn.auth_method(),
            kind: banner.kind(),
            serial: banner.serial(),
            properties: banner.properties(),
            features: banner.features().iter().map(String::as_str).collect(),
            banner: banner.as_str(),
        }
    }
}

pub fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;
    let conn = connect_device(&args.addr, timeout, None)?;

    print_info(&InfoOutput::new(&args.addr, &conn), format);
    let _ = conn.close();
    Ok(SUCCESS)
}

fn print_info(out: &InfoOutput<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KEY", "VALUE"])
                .add_row(vec!["address", out.address])
                .add_row(vec!["protocol", out.protocol_version.as_str()])
                .add_row(vec!["max payload".to_string(), out.max_payload_size.to_string()])
                .add_row(vec!["auth", auth_name(out.auth)])
                .add_row(vec!["kind", out.kind])
                .add_row(vec!["serial", out.serial]);
            for (key, value) in out.properties {
                table.add_row(vec![key.as_str(), value.as_str()]);
            }
            table.add_row(vec!["features".to_string(), out.features.join(", ")]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("Connection Info:");
            println!("  Address:          {}", out.address);
            println!("  Protocol:         {}", out.protocol_version);
            println!("  Max payload:      {} bytes", out.max_payload_size);
            println!("  Auth:             {}", auth_name(out.auth));
            println!("  Device:           {} ({})", out.kind, display_serial(out.serial));
            for (key, value) in out.properties {
                println!("  {key}: {value}");
            }
            if out.features.is_empty() {
                println!("  Features:         none");
            } else {
                println!("  Features:         {}", out.features.join(", "));
            }
        }
        OutputFormat::Raw => println!("{}", out.banner),
    }
}

fn auth_name(auth: AuthMethod) -> &'static str {
    match auth {
        AuthMethod::None => "none",
        AuthMethod::Signature => "signature",
        AuthMethod::PublicKey => "public key",
    }
}

fn display_serial(serial: &str) -> &str {
    if serial.is_empty() {
        "no serial"
    } else {
        serial
    }
}
