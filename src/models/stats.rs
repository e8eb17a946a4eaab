use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Live hub counters for GET /api/stats
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatsResponse {
    /// Sessions currently attached to a room
    pub active_sessions: usize,
    /// Rooms with at least one attached session
    pub active_rooms: usize,
    /// Documents currently resident in the cache
    pub live_documents: usize,
    /// Sockets accepted since startup
    pub total_connections: u64,
    /// Frames enqueued by broadcast since startup
    pub frames_relayed: u64,
    pub uptime_secs: u64,
}
