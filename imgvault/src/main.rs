mod api;
mod config;
mod error;
mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, response::IntoResponse, routing::get};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{MeterProvider, Unit};
use opentelemetry_sdk::Resource;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, instrument, warn};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::routes;
use crate::config::AppConfig;
use crate::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    Registry::default()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();

    let config = AppConfig::load()?;
    info!("loaded configuration: {:?}", config);

    let storage = Arc::new(Storage::new(&config).await?);

    // Prometheus-backed metrics, scraped from /metrics.
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let meter_provider = opentelemetry_sdk::metrics::MeterProvider::builder()
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", "imgvault"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .with_reader(exporter)
        .build();
    let meter = meter_provider.meter("imgvault");

    let request_counter = meter
        .u64_counter("http_requests_total")
        .with_description("Total number of HTTP requests")
        .with_unit(Unit::new("requests"))
        .init();
    let blob_upload_counter = meter
        .u64_counter("blob_uploads_total")
        .with_description("Blob upload sessions opened (mounted blobs open none)")
        .with_unit(Unit::new("uploads"))
        .init();
    let blob_size_histogram = meter
        .f64_histogram("blob_size_bytes")
        .with_description("Size of blobs in bytes")
        .with_unit(Unit::new("bytes"))
        .init();

    let app_metrics = Arc::new(routes::AppMetrics {
        request_counter,
        blob_upload_counter,
        blob_size_histogram,
    });

    let app_state = (Arc::clone(&storage), Arc::clone(&app_metrics));
    let metrics_registry = registry.clone();

    let mut app = Router::new()
        .route("/metrics", get(move || metrics_handler(metrics_registry.clone())))
        .merge(routes::registry_router(app_state))
        .layer(
            tower::ServiceBuilder::new().layer(tower_http::trace::TraceLayer::new_for_http()),
        );

    if config.auth.enabled {
        let settings = Arc::new(config.auth.clone());
        app = app
            .route(
                "/token",
                get(api::auth::token_handler).with_state(settings.clone()),
            )
            .layer(axum::middleware::from_fn_with_state(
                settings,
                api::auth::auth_middleware,
            ));
        info!("token authentication enabled");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("starting imgvaultd server on {}", addr);
    info!("metrics available at http://{}/metrics", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, starting graceful shutdown");
}

// Metrics endpoint handler for Prometheus scraping
#[instrument(name = "metrics_handler", skip_all)]
async fn metrics_handler(registry: prometheus::Registry) -> impl IntoResponse {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        warn!("failed to encode metrics: {}", e);
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "failed to encode metrics",
        )
            .into_response();
    }

    match String::from_utf8(buffer) {
        Ok(metrics_string) => metrics_string.into_response(),
        Err(e) => {
            warn!("failed to convert metrics to string: {}", e);
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "failed to convert metrics to string",
            )
                .into_response()
        }
    }
}
