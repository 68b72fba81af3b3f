use std::io::{IsTerminal, Write};

use adbmux_conn::ShellResponse;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ShellOutput<'a> {
    address: &'a str,
    command: &'a str,
    exit_code: u8,
    stdout: &'a str,
    stderr: &'a str,
}

pub fn print_shell(address: &str, command: &str, response: &ShellResponse, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ShellOutput {
                address,
                command,
                exit_code: response.exit_code,
                stdout: &response.stdout,
                stderr: &response.stderr,
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["COMMAND", "EXIT", "STDOUT", "STDERR"])
                .add_row(vec![
                    command.to_string(),
                    response.exit_code.to_string(),
                    response.stdout.trim_end().to_string(),
                    response.stderr.trim_end().to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            print!("{}", response.stdout);
            eprint!("{}", response.stderr);
            let _ = std::io::stdout().flush();
            eprintln!("[{address}] {command}: exit {}", response.exit_code);
        }
        OutputFormat::Raw => {
            print_raw(response.stdout.as_bytes());
            let mut err = std::io::stderr();
            let _ = err.write_all(response.stderr.as_bytes());
            let _ = err.flush();
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}
