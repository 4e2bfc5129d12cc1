//! gantry gateway binary.

use clap::Parser;
use std::path::PathBuf;

use gantry::config::{default_config, load_config};
use gantry::gateway::Gateway;
use gantry::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "gantry", version, about = "API gateway")]
struct Args {
    /// Path to the gateway configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to a JSON file holding the API descriptor set.
    #[arg(short, long)]
    apis: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => default_config(),
    };

    logging::init_logging(&config.observability.log_level);

    tracing::info!(
        listen_port = config.listen_port,
        control_port = config.control_port(),
        strict_routes = config.http_server_options.enable_strict_routes,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => {
                tracing::error!(
                    metrics_address = %config.observability.metrics_address,
                    "Failed to parse metrics address"
                );
            }
        }
    }

    let gateway = Gateway::new(config);

    if let Some(path) = &args.apis {
        let raw = std::fs::read_to_string(path)?;
        let descriptors: Vec<gantry::ApiDescriptor> = serde_json::from_str(&raw)?;
        tracing::info!(count = descriptors.len(), "Descriptor set loaded from file");
        gateway.set_descriptors(descriptors);
    }

    gateway.load_global_apps();

    gantry::server::run(gateway).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
