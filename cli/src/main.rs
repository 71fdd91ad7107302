//! OCPP Station: CLI runner
//!
//! Runs one OCPP 2.0.1 charging station until SIGINT/SIGTERM.
//!
//! ```sh
//! # Run with default config (~/.config/ocpp-station/config.toml)
//! ocpp-station
//!
//! # EVSE controllers given on the command line replace the configured list
//! ocpp-station 127.0.0.1:7001 127.0.0.1:7002
//!
//! # Different CSMS and station id
//! ocpp-station --csms-host csms.example.org:9000 --station-id CS042
//!
//! # Validate config without starting
//! ocpp-station --check
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use ocpp_station::config::{AppConfig, LoggingConfig};
use ocpp_station::{default_config_path, init_tracing, StationHandle};

/// OCPP 2.0.1 charging station client.
#[derive(Parser, Debug)]
#[command(
    name = "ocpp-station",
    version,
    about = "OCPP 2.0.1 charging station client",
    long_about = "Connects EVSE controllers to a CSMS over OCPP 2.0.1 and serves \
                  a local operator display API.\n\n\
                  Default config: ~/.config/ocpp-station/config.toml"
)]
struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(short, long, env = "OCPP_STATION_CONFIG")]
    config: Option<PathBuf>,

    /// Override the station id reported to the CSMS.
    #[arg(long)]
    station_id: Option<String>,

    /// Override the CSMS host (host:port).
    #[arg(long)]
    csms_host: Option<String>,

    /// Override the display API port.
    #[arg(long)]
    display_port: Option<u16>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration and exit without starting the station.
    #[arg(long)]
    check: bool,

    /// EVSE controller addresses (host:port). EVSE ids follow the order given.
    evse_addresses: Vec<String>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(ref id) = self.station_id {
            info!("CLI override: station.id = {}", id);
            config.station.id = id.clone();
        }
        if let Some(ref host) = self.csms_host {
            info!("CLI override: csms.host = {}", host);
            config.csms.host = host.clone();
        }
        if let Some(port) = self.display_port {
            info!("CLI override: display.port = {}", port);
            config.display.port = port;
        }
        if let Some(ref level) = self.log_level {
            info!("CLI override: log_level = {}", level);
            config.logging.level = level.clone();
        }
        if !self.evse_addresses.is_empty() {
            info!("CLI override: evse.addresses = {:?}", self.evse_addresses);
            config.evse.addresses = self.evse_addresses.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // ── Load configuration ─────────────────────────────────────
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    let mut config = match AppConfig::load(&config_path) {
        Ok(cfg) => {
            let mut logging = cfg.logging.clone();
            if let Some(ref level) = cli.log_level {
                logging.level = level.clone();
            }
            init_tracing(&logging);
            info!("Configuration loaded from {}", config_path.display());
            cfg
        }
        Err(e) => {
            init_tracing(&LoggingConfig {
                level: cli.log_level.clone().unwrap_or_else(|| "info".to_string()),
                ..LoggingConfig::default()
            });
            error!("Failed to load config from {}: {}", config_path.display(), e);
            error!("Using default configuration.");
            AppConfig::default()
        }
    };

    cli.apply_overrides(&mut config);

    // ── Config validation mode ─────────────────────────────────
    if cli.check {
        config.validate()?;
        println!("✅ Configuration is valid");
        println!("   Config file : {}", config_path.display());
        println!("   Station id  : {}", config.station.id);
        println!("   CSMS URL    : {}", config.csms_url());
        for (evse_id, addr) in config.evse.assignments() {
            println!("   EVSE {:<6} : {}", evse_id, addr);
        }
        println!("   Display     : {}", config.display.address());
        println!("   Log level   : {}", config.logging.level);
        return Ok(());
    }

    // ── Start station ──────────────────────────────────────────
    let handle = StationHandle::start(config).await?;

    handle.install_signal_handler();

    info!("🚀 Press Ctrl+C to shutdown gracefully.");

    handle.shutdown_signal().wait().await;
    handle.wait().await;

    Ok(())
}
