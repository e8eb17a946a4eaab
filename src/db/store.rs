use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::models::{Room, SnapshotMeta, SnapshotRecord, UserInfo, Visibility};

/// Errors surfaced by a [`RoomStore`].
///
/// `Unavailable` is the transient class: callers on the silent-retry paths
/// (touch, leave, periodic save) run these through [`with_backoff`].
#[derive(Debug)]
pub enum StoreError {
    /// Primary-key collision on create
    AlreadyExists,
    /// Strict lookup missed
    NotFound,
    /// Transient store trouble; retryable
    Unavailable(String),
    /// Anything the caller should not retry
    Fatal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::AlreadyExists => write!(f, "record already exists"),
            StoreError::NotFound => write!(f, "record not found"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {}", e),
            StoreError::Fatal(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::AlreadyExists,
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            _ => StoreError::Fatal(e.to_string()),
        }
    }
}

/// Durable persistence for rooms, participants, and snapshots.
///
/// Every call is independently transactional; the hub never spans a
/// transaction across calls. Implemented by [`crate::db::PgStore`] and, for
/// storeless deployments and tests, [`crate::db::MemStore`].
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn find_room(&self, id: &str) -> Result<Option<Room>, StoreError>;

    /// Fails with `AlreadyExists` on primary-key collision.
    async fn create_room(
        &self,
        id: &str,
        name: &str,
        creator_id: &str,
        visibility: Visibility,
    ) -> Result<Room, StoreError>;

    async fn update_room(
        &self,
        id: &str,
        name: Option<&str>,
        visibility: Option<Visibility>,
    ) -> Result<Room, StoreError>;

    /// Soft delete; participants and snapshots become unreachable with it.
    async fn delete_room(&self, id: &str) -> Result<(), StoreError>;

    /// Bumps `last_active`. Concurrent bumps are fine.
    async fn touch_room(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn record_join(
        &self,
        room_id: &str,
        user: &UserInfo,
        client_id: Uuid,
        role: &str,
    ) -> Result<Uuid, StoreError>;

    /// Marks the open participant row closed. Idempotent.
    async fn record_leave(&self, client_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Closes every row still open; returns how many were closed.
    async fn close_stale_participants(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn newest_snapshot(&self, room_id: &str) -> Result<Option<SnapshotRecord>, StoreError>;

    /// Server-assigned version = max(existing) + 1, atomic per room.
    async fn write_snapshot(
        &self,
        room_id: &str,
        payload: Vec<u8>,
        state_vector: Vec<u8>,
    ) -> Result<i32, StoreError>;

    /// Deletes all but the newest `keep`; returns how many were dropped.
    async fn prune_snapshots(&self, room_id: &str, keep: u32) -> Result<u64, StoreError>;

    async fn list_snapshots(
        &self,
        room_id: &str,
        limit: u32,
    ) -> Result<Vec<SnapshotMeta>, StoreError>;
}

const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY_MS: u64 = 100;
const MAX_DELAY_MS: u64 = 1_600;

/// Run a store operation with capped exponential backoff on transient errors.
pub async fn with_backoff<T, F, Fut>(op: &str, mut call: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delay = Duration::from_millis(BASE_DELAY_MS);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    op, attempt, MAX_ATTEMPTS, delay, e
                );
                tokio::time::sleep(delay).await;
                delay = Duration::from_millis((delay.as_millis() as u64 * 2).min(MAX_DELAY_MS));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn backoff_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Unavailable("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_gives_up_on_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Fatal("broken".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
