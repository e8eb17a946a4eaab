use axum::extract::State;
use axum::Json;
use std::sync::Arc;

use crate::models::StatsResponse;
use crate::ws::Hub;

/// Live hub counters
pub async fn get_stats(State(hub): State<Arc<Hub>>) -> Json<StatsResponse> {
    Json(hub.stats().await)
}
