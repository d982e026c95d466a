//! Resilience Plane - dependency protection and resource-driven degradation

use std::process::ExitCode;

use clap::Parser;
use serde_json::json;
use tracing::{error, info};

use resilience_plane::{
    cli::{Cli, Command},
    config::Config,
    monitor::{DegradationLevel, MetricsSource, SystemSampler, evaluate_level},
    server::Server,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(code) => return code,
    };

    match cli.command {
        Some(Command::Sample) => run_sample(&config).await,
        Some(Command::Config) => print_config(&config),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> Result<Config, ExitCode> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            if cli.no_monitor {
                config.monitor.enabled = false;
            }
            Ok(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            Err(ExitCode::FAILURE)
        }
    }
}

/// Print one resource sample and the level it would produce from NONE
async fn run_sample(config: &Config) -> ExitCode {
    let sampler = SystemSampler::new();
    // CPU usage needs two refreshes spaced apart
    tokio::time::sleep(SystemSampler::min_interval()).await;

    match sampler.sample().await {
        Ok(sample) => {
            let level = evaluate_level(
                DegradationLevel::None,
                sample.cpu.usage_percent,
                sample.memory.usage_percent,
                &config.monitor.thresholds,
            );
            let output = json!({
                "metrics": sample,
                "level": level,
                "disabled_features": level.disabled_features(),
            });
            match serde_json::to_string_pretty(&output) {
                Ok(text) => {
                    println!("{text}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Failed to serialize sample: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("Sampling failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Print the effective configuration
fn print_config(config: &Config) -> ExitCode {
    match serde_yaml::to_string(config) {
        Ok(yaml) => {
            print!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to serialize configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the health and admin server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        breaker_overrides = config.circuit_breakers.len(),
        monitor = config.monitor.enabled,
        "Starting resilience plane"
    );

    if let Err(e) = Server::new(config).run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
