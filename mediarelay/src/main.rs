mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use mediarelay_core::{alert, logging, Config};

use server::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "mediarelay")]
#[command(about = "Real-time media relay worker", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "MEDIARELAY_CONFIG")]
    config: Option<String>,

    /// Override `server.host`
    #[arg(long)]
    host: Option<String>,

    /// Override `server.port`
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging (the guard flushes file output on exit)
    let _log_guard = logging::init_logging(&config.logging)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        ports = %format!("[{}, {})", config.ports.start, config.ports.end),
        local_ip = %config.media.local_ip,
        "Media relay worker starting"
    );

    // 4. Panic alerting
    let alerts = alert::from_config(&config.alert);

    // 5. Serve until shutdown
    RelayServer::new(Arc::new(config), alerts).run().await
}
