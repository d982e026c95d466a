//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Resilience plane - circuit breakers, retries, graceful degradation and
/// resource-driven feature shedding
#[derive(Parser, Debug)]
#[command(name = "resilience-plane")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "RESILIENCE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "RESILIENCE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "RESILIENCE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "RESILIENCE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "RESILIENCE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Do not run the background resource monitor
    #[arg(long)]
    pub no_monitor: bool,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the health and admin server (default)
    Serve,

    /// Take one resource sample and print it with its degradation level
    Sample,

    /// Print the effective configuration as YAML
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_serve() {
        let cli = Cli::parse_from(["resilience-plane"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_global_config_flag_after_subcommand() {
        let cli = Cli::parse_from(["resilience-plane", "sample", "--config", "plane.yaml"]);
        assert!(matches!(cli.command, Some(Command::Sample)));
        assert_eq!(cli.config, Some(PathBuf::from("plane.yaml")));
    }
}
