use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::db::StoreError;
use crate::models::{
    CreateRoomRequest, ErrorResponse, ExistsResponse, UpdateRoomRequest,
};
use crate::ws::Hub;

fn store_failure(context: &str, e: StoreError) -> Response {
    error!("{}: {}", context, e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(500, "error", "persistence failure")),
    )
        .into_response()
}

fn room_not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(404, "not_found", format!("room '{}' not found", id))),
    )
        .into_response()
}

/// Create a room
pub async fn create_room(
    State(hub): State<Arc<Hub>>,
    Json(body): Json<CreateRoomRequest>,
) -> Response {
    match hub
        .store()
        .create_room(&body.id, &body.name, &body.creator_id, body.visibility)
        .await
    {
        Ok(room) => {
            info!("room {} created by {}", room.id, room.creator_id);
            (StatusCode::CREATED, Json(room)).into_response()
        }
        Err(StoreError::AlreadyExists) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse::new(
                409,
                "conflict",
                format!("room '{}' already exists", body.id),
            )),
        )
            .into_response(),
        Err(e) => store_failure("failed to create room", e),
    }
}

/// Fetch a room
pub async fn get_room(State(hub): State<Arc<Hub>>, Path(id): Path<String>) -> Response {
    match hub.store().find_room(&id).await {
        Ok(Some(room)) => Json(room).into_response(),
        Ok(None) => room_not_found(&id),
        Err(e) => store_failure("failed to fetch room", e),
    }
}

/// Check whether a room exists
pub async fn room_exists(State(hub): State<Arc<Hub>>, Path(id): Path<String>) -> Response {
    match hub.store().find_room(&id).await {
        Ok(found) => Json(ExistsResponse {
            exists: found.is_some(),
        })
        .into_response(),
        Err(e) => store_failure("failed to check room", e),
    }
}

/// Rename a room or change its visibility
pub async fn update_room(
    State(hub): State<Arc<Hub>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateRoomRequest>,
) -> Response {
    match hub
        .store()
        .update_room(&id, body.name.as_deref(), body.visibility)
        .await
    {
        Ok(room) => Json(room).into_response(),
        Err(StoreError::NotFound) => room_not_found(&id),
        Err(e) => store_failure("failed to update room", e),
    }
}

/// Soft-delete a room
pub async fn delete_room(State(hub): State<Arc<Hub>>, Path(id): Path<String>) -> Response {
    match hub.store().delete_room(&id).await {
        Ok(()) => {
            info!("room {} deleted", id);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(StoreError::NotFound) => room_not_found(&id),
        Err(e) => store_failure("failed to delete room", e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SnapshotListQuery {
    pub limit: Option<u32>,
}

/// List a room's snapshot metadata, newest first
pub async fn list_snapshots(
    State(hub): State<Arc<Hub>>,
    Path(id): Path<String>,
    Query(query): Query<SnapshotListQuery>,
) -> Response {
    let store = hub.store();
    match store.find_room(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return room_not_found(&id),
        Err(e) => return store_failure("failed to fetch room", e),
    }
    match store.list_snapshots(&id, query.limit.unwrap_or(10)).await {
        Ok(metas) => Json(metas).into_response(),
        Err(e) => store_failure("failed to list snapshots", e),
    }
}
