use std::net::SocketAddr;

use axum::Router;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod error;
mod extract;
mod middleware;
mod routes;
mod state;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Taskmine Verification API",
        version = "0.1.0",
        description = "Verifies numeric claims in generated answers against process-mining datasets and rolls request traces up into daily KPI panels."
    ),
    paths(
        routes::health::health_check,
        routes::datasets::list_datasets,
        routes::analyze::analyze_answer,
        routes::panel::get_panel,
        routes::schema::get_schema,
        routes::kpis::get_kpis_today,
        routes::kpis::get_kpis_for_date,
        routes::kpis::save_kpis_for_date,
        routes::kpis::get_kpi_range,
    ),
    components(schemas(
        HealthResponse,
        routes::datasets::DatasetInfo,
        routes::datasets::DatasetsResponse,
        routes::analyze::AnalyzeRequest,
        routes::analyze::AnalyzeResponse,
        routes::schema::SchemaResponse,
        routes::kpis::SavedRollupResponse,
        taskmine_core::error::ApiError,
        taskmine_core::table::TableFilters,
        taskmine_core::table::TimeRange,
        taskmine_core::claims::Claim,
        taskmine_core::recompute::VerificationResult,
        taskmine_core::verify::VerificationSummary,
        taskmine_core::schema::HallucinationCheck,
        taskmine_core::schema::UnknownEntity,
        taskmine_core::routing::RouterDecision,
        taskmine_core::metrics::PanelMetrics,
        taskmine_core::metrics::AgingBuckets,
        taskmine_core::views::PanelView,
        taskmine_core::views::RankedValue,
        taskmine_core::views::ViewData,
        taskmine_core::rollup::DailyRollup,
        taskmine_core::rollup::KpiPanel,
        taskmine_core::rollup::EmptyRollup,
        taskmine_core::rollup::LatencyPanel,
        taskmine_core::rollup::LatencyStats,
        taskmine_core::rollup::Adoption,
        taskmine_core::rollup::Resolution,
    ))
)]
struct ApiDoc;

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub datasets_loaded: Vec<String>,
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskmine_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = config::AppConfig::from_env();
    let datasets = state::load_datasets(&config);
    if datasets.is_empty() {
        tracing::warn!(data_dir = %config.data_dir.display(), "No datasets loaded; serving degraded");
    }
    let app_state = state::AppState::new(&config, datasets);

    let cors_layer = middleware::cors::build_cors_layer();

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::datasets::router())
        .merge(routes::analyze::router())
        .merge(routes::panel::router())
        .merge(routes::schema::router())
        .merge(routes::kpis::router())
        .layer(middleware::trace_log::TraceLogLayer::new(
            app_state.traces.clone(),
            config.enable_tracing,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(
        tolerance_pct = config.tolerance_pct,
        tracing_enabled = config.enable_tracing,
        "Taskmine API listening on {}",
        addr
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, %addr, "Failed to bind listener");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Server stopped with an error");
        std::process::exit(1);
    }
}
