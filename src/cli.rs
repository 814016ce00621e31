//! Command-line interface for scriptvisor.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for scriptvisor.
#[derive(Parser)]
#[command(name = "svisor", version, author)]
#[command(about = "Supervise a fleet of launcher scripts", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for svisor.
#[derive(Subcommand)]
pub enum Commands {
    /// List the configured scripts in start order.
    List {
        /// Path to the configuration file (defaults to `scriptvisor.yaml`, then `config.json`).
        #[arg(short, long)]
        config: Option<String>,
        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Run the supervisor in the foreground.
    Run {
        /// Path to the configuration file (defaults to `scriptvisor.yaml`, then `config.json`).
        #[arg(short, long)]
        config: Option<String>,
        /// Start every configured script in order, not only the autostart ones.
        #[arg(long)]
        start_all: bool,
        /// Skip the autostart sequence.
        #[arg(long)]
        no_autostart: bool,
        /// Start only the named script(s) immediately. May be repeated.
        #[arg(short, long = "script", value_name = "NAME")]
        scripts: Vec<String>,
        /// Leave once no script is running and nothing is pending.
        #[arg(long)]
        exit_when_idle: bool,
        /// Only print output lines containing this text (case-insensitive).
        #[arg(long, value_name = "TEXT")]
        filter: Option<String>,
        /// Print one JSON object per event.
        #[arg(long)]
        json: bool,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
