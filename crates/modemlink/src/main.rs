mod cmd;
mod exit;
mod logging;
mod output;

use std::path::{Path, PathBuf};

use clap::Parser;
use modemlink_channel::LinkConfig;

use crate::cmd::Command;
use crate::exit::{CliError, CliResult, USAGE};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "modemlink", version, about = "Modem link framing CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Link configuration file (JSON).
    #[arg(long, value_name = "FILE", env = "MODEMLINK_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = load_config(cli.config.as_deref())
        .and_then(|config| cmd::run(cli.command, format, config));

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

fn load_config(path: Option<&Path>) -> CliResult<LinkConfig> {
    let Some(path) = path else {
        return Ok(LinkConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|err| exit::io_error(&format!("cannot read {}", path.display()), err))?;
    let config: LinkConfig = serde_json::from_str(&text).map_err(|err| {
        CliError::new(USAGE, format!("invalid config {}: {err}", path.display()))
    })?;
    config
        .validate()
        .map_err(|err| exit::link_error("invalid config", err))?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}
