//! Station runtime.
//!
//! [`StationHandle`] wires configuration into a running station: EVSE links,
//! the CSMS WebSocket and its transport, the charging controller and the
//! operator display server. The CLI binary drives its lifecycle.

use std::sync::OnceLock;
use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::application::charging::{ChargingStation, StationSettings, StationTasks};
use crate::application::transport::{CsmsTransport, TransportConfig, TransportTasks};
use crate::config::{AppConfig, LoggingConfig};
use crate::infrastructure::csms;
use crate::infrastructure::evse::EvseConnector;
use crate::interfaces::http::create_display_router;
use crate::support::errors::BootstrapError;
use crate::support::shutdown::{ShutdownCoordinator, ShutdownSignal};

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let installed = if logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if installed.is_err() {
        warn!("Tracing subscriber already installed, keeping the existing one");
    }
}

/// The global recorder can only be installed once per process, so a second
/// station started in the same process reuses it.
fn prometheus_handle() -> PrometheusHandle {
    static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

    PROM_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                info!("📊 Prometheus metrics recorder installed");
                handle
            }
            Err(e) => {
                warn!(error = %e, "Failed to install Prometheus recorder, /metrics will stay empty");
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}

/// Handle to a running charging station.
pub struct StationHandle {
    /// Controller for start/stop requests and EVSE readings.
    pub station: ChargingStation,
    /// The configuration the station was started with.
    pub config: AppConfig,

    shutdown: ShutdownCoordinator,
    transport_tasks: TransportTasks,
    station_tasks: StationTasks,
    display_task: JoinHandle<()>,
}

impl StationHandle {
    /// Bring the station up.
    ///
    /// 1. Validate configuration and read the EVSE password
    /// 2. Connect every configured EVSE
    /// 3. Connect to the CSMS and start the transport
    /// 4. Start the controller and send BootNotification
    /// 5. Serve the operator display API
    ///
    /// Only steps 1-3 and binding the display port can fail. A rejected or
    /// unanswered BootNotification is logged and the station keeps running.
    pub async fn start(config: AppConfig) -> Result<Self, BootstrapError> {
        config.validate()?;
        info!(station_id = %config.station.id, "Starting OCPP charging station...");

        let metrics_handle = prometheus_handle();
        let shutdown = ShutdownCoordinator::new(Duration::from_secs(
            config.display.shutdown_timeout_secs,
        ));
        let signal = shutdown.signal();

        // ── EVSE links ─────────────────────────────────────────
        let password = config.evse.load_password()?;
        let mut evses = Vec::new();
        for (evse_id, addr) in config.evse.assignments() {
            let evse = EvseConnector::connect(
                evse_id,
                &addr,
                password.clone(),
                config.evse.poll_options(),
                signal.clone(),
            )
            .await?;
            evses.push(evse);
        }
        info!(count = evses.len(), "All EVSE controllers connected");

        // ── CSMS link ──────────────────────────────────────────
        let url = config.csms_url();
        let (writer, reader) = csms::connect(&url).await?;
        let (transport, inbound, transport_tasks) = CsmsTransport::spawn(
            writer,
            reader,
            TransportConfig::from(&config.csms),
            signal.clone(),
        );

        // ── Controller ─────────────────────────────────────────
        let (station, station_tasks) = ChargingStation::spawn(
            StationSettings::from(&config.station),
            transport,
            inbound,
            evses,
            signal.clone(),
        );

        match station.boot().await {
            Ok(outcome) if outcome.accepted => {}
            Ok(_) => warn!("⚠️ BootNotification was not accepted, continuing with configured intervals"),
            Err(e) => warn!(error = %e, "⚠️ BootNotification failed, continuing with configured intervals"),
        }

        // ── Display server ─────────────────────────────────────
        let addr = config.display.address();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| BootstrapError::Bind {
                addr: addr.clone(),
                source,
            })?;
        info!("Display API listening on http://{}", addr);
        info!("Swagger UI available at http://{}/docs/", addr);

        let router = create_display_router(station.clone(), metrics_handle);
        let display_shutdown = signal.clone();
        let display_task = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                display_shutdown.wait().await;
                info!("🛑 Display server received shutdown signal");
            });
            if let Err(e) = server.await {
                error!("Display server error: {}", e);
            }
        });

        info!("🚀 Station started.");

        Ok(Self {
            station,
            config,
            shutdown,
            transport_tasks,
            station_tasks,
            display_task,
        })
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.signal()
    }

    /// Install SIGINT/SIGTERM listeners that trigger shutdown.
    pub fn install_signal_handler(&self) {
        self.shutdown.start_signal_listener();
    }

    /// Trigger shutdown without waiting for it.
    pub fn trigger_shutdown(&self) {
        self.shutdown.signal().trigger();
    }

    /// Wait for shutdown to be triggered, then for every task to stop,
    /// bounded by `display.shutdown_timeout_secs`.
    pub async fn wait(self) {
        let Self {
            shutdown,
            transport_tasks,
            station_tasks,
            display_task,
            ..
        } = self;

        let completed = shutdown
            .shutdown_with_cleanup(|| async move {
                if let Err(e) = display_task.await {
                    error!("Display server task panicked: {}", e);
                }
                station_tasks.join().await;
                transport_tasks.join().await;
            })
            .await;

        if completed {
            info!("👋 Station shutdown complete");
        } else {
            warn!("Station tasks did not stop in time");
        }
    }

    /// Trigger shutdown and wait for completion.
    pub async fn shutdown(self) {
        info!("🛑 Shutting down station...");
        self.trigger_shutdown();
        self.wait().await;
    }
}
