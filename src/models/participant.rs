use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One admission of one client into one room. Append-only; `left_at` is
/// null exactly while the session is live in this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub id: Uuid,
    pub room_id: String,
    pub user_id: String,
    pub client_id: Uuid,
    pub user_name: String,
    pub user_color: String,
    pub role: String,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

/// Role written on every join. Role transitions are not a thing the hub does.
pub const ROLE_EDITOR: &str = "editor";
