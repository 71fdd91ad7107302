//! Display router with Swagger UI

use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::common::ApiResponse;
use super::modules::{charging, health, metrics};
use crate::application::ChargingStation;

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        charging::start_charging,
        charging::stop_charging,
        charging::charge_status,
        charging::active_evse_ids,
        charging::current_transaction,
    ),
    components(schemas(
        health::HealthResponse,
        health::CsmsLinkHealth,
        charging::RfidBody,
        charging::ChargeStatusDto,
        charging::StartedDto,
        charging::TransactionDto,
        ApiResponse<charging::StartedDto>,
        ApiResponse<charging::TransactionDto>,
        ApiResponse<String>,
    )),
    tags(
        (name = "Health", description = "Station liveness"),
        (name = "Charging", description = "Operator display: badge swipes and live EVSE readings")
    ),
    info(
        title = "OCPP Station Display API",
        description = "Local operator API of an OCPP 2.0.1 charging station"
    )
)]
pub struct ApiDoc;

/// Build the operator display router.
///
/// Every response carries permissive CORS headers so a browser UI served
/// from anywhere can poll it.
pub fn create_display_router(station: ChargingStation, metrics_handle: PrometheusHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let charging_routes = Router::new()
        .route("/start/{evse_id}", post(charging::start_charging))
        .route("/stop/{evse_id}", post(charging::stop_charging))
        .route("/chargestatus/{evse_id}", get(charging::charge_status))
        .route("/evses/active/ids", get(charging::active_evse_ids))
        .route("/transaction/{evse_id}", get(charging::current_transaction))
        .with_state(charging::ChargingState {
            station: station.clone(),
        });

    let health_routes = Router::new()
        .route("/health", get(health::health_check))
        .with_state(health::HealthState {
            station,
            started_at: Arc::new(Instant::now()),
        });

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics::prometheus_metrics))
        .with_state(metrics::MetricsState {
            handle: metrics_handle,
        });

    let swagger_routes = SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi());

    Router::new()
        .merge(swagger_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .merge(charging_routes)
        .layer(middleware::from_fn(metrics::http_metrics_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
