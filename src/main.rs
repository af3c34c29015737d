use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use vantage::config::EngineConfig;
use vantage::engine::Engine;

/// Command-line arguments for the telemetry engine
#[derive(Parser)]
#[command(
    name = "vantage",
    about = "Telemetry aggregation and alerting engine",
    long_about = "Collects metrics, health checks and traces from monitored services, \
                  evaluates alerting rules over the stored series and exposes the \
                  aggregate state through a scrape endpoint and export formats."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,
}

impl Cli {
    /// Validate the CLI arguments
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            // Missing files are handled gracefully by EngineConfig::load,
            // which warns and falls back to defaults.
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }
                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting telemetry engine");

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let config = EngineConfig::load(cli.config.as_deref());

    let mut engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to initialize engine: {:#}", e);
            std::process::exit(1);
        }
    };

    info!("Engine initialized successfully. Press Ctrl+C to stop.");

    if let Err(e) = engine.run().await {
        error!("Engine terminated with error: {:#}", e);
        std::process::exit(1);
    }

    info!("Engine shutdown complete");
}
