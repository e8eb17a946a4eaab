use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::docs::ApiDoc;
use crate::handlers;
use crate::ws::{self, Hub};

/// Create API routes
pub fn create_api_routes() -> Router<Arc<Hub>> {
    Router::new()
        .route("/rooms", post(handlers::create_room))
        .route(
            "/rooms/:id",
            get(handlers::get_room)
                .patch(handlers::update_room)
                .delete(handlers::delete_room),
        )
        .route("/rooms/:id/exists", get(handlers::room_exists))
        .route("/rooms/:id/snapshots", get(handlers::list_snapshots))
        .route("/stats", get(handlers::get_stats))
}

/// Assemble the full application: health endpoints, the REST surface, the
/// WebSocket endpoint, and Swagger UI.
pub fn build_router(hub: Arc<Hub>, cors_origin: Option<&str>) -> Router {
    let cors = match cors_origin {
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(origin) => CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(Any)
                .allow_headers(Any),
            Err(e) => {
                warn!("invalid cors_origin '{}', allowing any origin: {}", origin, e);
                CorsLayer::permissive()
            }
        },
        None => CorsLayer::permissive(),
    };

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::ready_check))
        .route("/ws", get(ws::hub::ws_endpoint))
        .nest("/api", create_api_routes())
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(hub)
}
