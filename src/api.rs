use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};

use crate::app_context::AppContext;
use crate::types::FleetAggregate;

pub fn apply_routes(parent: Router, context: Arc<AppContext>) -> Router {
    let api_router = Router::new()
        .route("/fleet/statistics", get(fleet_statistics_handler))
        .with_state(context);

    parent.merge(api_router)
}

async fn fleet_statistics_handler(
    State(context): State<Arc<AppContext>>,
) -> Json<FleetAggregate> {
    Json(context.fleet_statistics().await)
}
