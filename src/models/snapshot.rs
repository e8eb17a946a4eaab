use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// A loaded snapshot: the resume point for a room's document.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub payload: Vec<u8>,
    pub state_vector: Vec<u8>,
    pub version: i32,
}

/// Snapshot metadata as listed by the REST surface. Payload bytes stay in
/// the store.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SnapshotMeta {
    pub id: Uuid,
    pub room_id: String,
    pub version: i32,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}
