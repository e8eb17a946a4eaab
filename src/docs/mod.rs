use crate::models::*;
use utoipa::OpenApi;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/ready",
    tag = "health",
    responses(
        (status = 200, description = "Service is ready", body = ReadyResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Create a room
#[utoipa::path(
    post,
    path = "/api/rooms",
    tag = "rooms",
    request_body = CreateRoomRequest,
    responses(
        (status = 201, description = "Room created", body = Room),
        (status = 409, description = "Room id already taken", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn create_room_doc() {}

/// Fetch a room
#[utoipa::path(
    get,
    path = "/api/rooms/{id}",
    tag = "rooms",
    responses(
        (status = 200, description = "Room found", body = Room),
        (status = 404, description = "Room not found", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Room ID")
    )
)]
#[allow(dead_code)]
pub async fn get_room_doc() {}

/// Check whether a room exists
#[utoipa::path(
    get,
    path = "/api/rooms/{id}/exists",
    tag = "rooms",
    responses(
        (status = 200, description = "Existence flag", body = ExistsResponse)
    ),
    params(
        ("id" = String, Path, description = "Room ID")
    )
)]
#[allow(dead_code)]
pub async fn room_exists_doc() {}

/// Rename a room or change its visibility
#[utoipa::path(
    patch,
    path = "/api/rooms/{id}",
    tag = "rooms",
    request_body = UpdateRoomRequest,
    responses(
        (status = 200, description = "Room updated", body = Room),
        (status = 404, description = "Room not found", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Room ID")
    )
)]
#[allow(dead_code)]
pub async fn update_room_doc() {}

/// Soft-delete a room
#[utoipa::path(
    delete,
    path = "/api/rooms/{id}",
    tag = "rooms",
    responses(
        (status = 204, description = "Room deleted"),
        (status = 404, description = "Room not found", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Room ID")
    )
)]
#[allow(dead_code)]
pub async fn delete_room_doc() {}

/// List a room's snapshots, newest first
#[utoipa::path(
    get,
    path = "/api/rooms/{id}/snapshots",
    tag = "rooms",
    responses(
        (status = 200, description = "Snapshot metadata", body = [SnapshotMeta]),
        (status = 404, description = "Room not found", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Room ID"),
        ("limit" = Option<u32>, Query, description = "Maximum entries to return")
    )
)]
#[allow(dead_code)]
pub async fn list_snapshots_doc() {}

/// Live hub counters
#[utoipa::path(
    get,
    path = "/api/stats",
    tag = "stats",
    responses(
        (status = 200, description = "Hub statistics", body = StatsResponse)
    )
)]
#[allow(dead_code)]
pub async fn stats_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        create_room_doc,
        get_room_doc,
        room_exists_doc,
        update_room_doc,
        delete_room_doc,
        list_snapshots_doc,
        stats_doc,
    ),
    components(schemas(
        HealthResponse,
        ReadyResponse,
        Room,
        Visibility,
        CreateRoomRequest,
        UpdateRoomRequest,
        ExistsResponse,
        SnapshotMeta,
        StatsResponse,
        ErrorResponse,
    )),
    tags(
        (name = "health", description = "Liveness and readiness"),
        (name = "rooms", description = "Room management"),
        (name = "stats", description = "Hub statistics")
    )
)]
pub struct ApiDoc;
