use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use futures::future::ready;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use fleet_stats_rs::{
    api, app_context::AppContext, config::Config, server, service::FleetStatsService,
};

fn setup_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "fleet statistics service"
}

fn start_server(config: &Config, context: Arc<AppContext>) -> JoinHandle<()> {
    let liveness = context.liveness.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = api::apply_routes(router, context);
    let router = server::setup_metrics_routes(router);

    let bind = config.bind_address();

    tokio::task::spawn(async move {
        server::serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config =
        Config::init_with_defaults().context("failed to load configuration from environment")?;
    setup_tracing(&config);

    info!("starting fleet statistics service");

    let service = FleetStatsService::new(config.clone()).await?;

    let server_handle = start_server(&config, service.context());
    info!("serving health, metrics and queries on {}", config.bind_address());

    let result = service.run().await;

    server_handle.abort();
    result
}
