//! Command-line argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// qubesctl - converge Qubes OS domains to a declared state
#[derive(Parser, Debug)]
#[command(name = "qubesctl")]
#[command(about = "qubesctl - converge Qubes OS domains to a declared state")]
#[command(version)]
pub struct Args {
    /// Request document (YAML or JSON). Use `-` to read from stdin.
    pub request: String,

    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "QUBESCTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Host description for the in-memory backend (built-in demo host if omitted)
    #[arg(short, long)]
    pub world: Option<PathBuf>,

    /// Write the resulting host back to the `--world` file
    #[arg(long, requires = "world")]
    pub save_world: bool,

    /// Where `createinventory` writes its output
    #[arg(long)]
    pub inventory: Option<PathBuf>,
}
