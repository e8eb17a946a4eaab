use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::db::store::{RoomStore, StoreError};
use crate::models::{Room, SnapshotMeta, SnapshotRecord, UserInfo, Visibility};

/// Postgres-backed repository
pub struct PgStore {
    pool: PgPool,
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS rooms (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        creator_id  TEXT NOT NULL,
        visibility  TEXT NOT NULL DEFAULT 'public',
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_active TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted     BOOLEAN NOT NULL DEFAULT FALSE
    );
    CREATE TABLE IF NOT EXISTS participants (
        id         UUID PRIMARY KEY,
        room_id    TEXT NOT NULL REFERENCES rooms(id),
        user_id    TEXT NOT NULL,
        client_id  UUID NOT NULL,
        user_name  TEXT NOT NULL,
        user_color TEXT NOT NULL,
        role       TEXT NOT NULL DEFAULT 'editor',
        joined_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        left_at    TIMESTAMPTZ
    );
    CREATE INDEX IF NOT EXISTS participants_open_idx
        ON participants (client_id) WHERE left_at IS NULL;
    CREATE TABLE IF NOT EXISTS snapshots (
        id           UUID PRIMARY KEY,
        room_id      TEXT NOT NULL REFERENCES rooms(id),
        payload      BYTEA NOT NULL,
        state_vector BYTEA NOT NULL,
        version      INTEGER NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (room_id, version)
    );
"#;

impl PgStore {
    /// Create a new database connection pool
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    /// Create the three tables if they are missing. Idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for stmt in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!("Database schema ready");
        Ok(())
    }

    fn room_from_row(row: &sqlx::postgres::PgRow) -> Result<Room, StoreError> {
        let visibility: String = row.try_get("visibility").map_err(StoreError::from)?;
        Ok(Room {
            id: row.try_get("id").map_err(StoreError::from)?,
            name: row.try_get("name").map_err(StoreError::from)?,
            creator_id: row.try_get("creator_id").map_err(StoreError::from)?,
            visibility: Visibility::parse(&visibility),
            created_at: row.try_get("created_at").map_err(StoreError::from)?,
            last_active: row.try_get("last_active").map_err(StoreError::from)?,
        })
    }
}

#[async_trait]
impl RoomStore for PgStore {
    async fn find_room(&self, id: &str) -> Result<Option<Room>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, creator_id, visibility, created_at, last_active \
             FROM rooms WHERE id = $1 AND deleted = FALSE",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::room_from_row).transpose()
    }

    async fn create_room(
        &self,
        id: &str,
        name: &str,
        creator_id: &str,
        visibility: Visibility,
    ) -> Result<Room, StoreError> {
        let row = sqlx::query(
            "INSERT INTO rooms (id, name, creator_id, visibility) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, name, creator_id, visibility, created_at, last_active",
        )
        .bind(id)
        .bind(name)
        .bind(creator_id)
        .bind(visibility.as_str())
        .fetch_one(&self.pool)
        .await?;

        Self::room_from_row(&row)
    }

    async fn update_room(
        &self,
        id: &str,
        name: Option<&str>,
        visibility: Option<Visibility>,
    ) -> Result<Room, StoreError> {
        let row = sqlx::query(
            "UPDATE rooms \
             SET name = COALESCE($2, name), visibility = COALESCE($3, visibility) \
             WHERE id = $1 AND deleted = FALSE \
             RETURNING id, name, creator_id, visibility, created_at, last_active",
        )
        .bind(id)
        .bind(name)
        .bind(visibility.map(|v| v.as_str()))
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        Self::room_from_row(&row)
    }

    async fn delete_room(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE rooms SET deleted = TRUE WHERE id = $1 AND deleted = FALSE")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn touch_room(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE rooms SET last_active = GREATEST(last_active, $2) WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_join(
        &self,
        room_id: &str,
        user: &UserInfo,
        client_id: Uuid,
        role: &str,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO participants (id, room_id, user_id, client_id, user_name, user_color, role) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(room_id)
        .bind(&user.id)
        .bind(client_id)
        .bind(&user.name)
        .bind(&user.color)
        .bind(role)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn record_leave(&self, client_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE participants SET left_at = $2 WHERE client_id = $1 AND left_at IS NULL")
            .bind(client_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close_stale_participants(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE participants SET left_at = $1 WHERE left_at IS NULL")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn newest_snapshot(&self, room_id: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT payload, state_vector, version FROM snapshots \
             WHERE room_id = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(SnapshotRecord {
                payload: row.try_get("payload").map_err(StoreError::from)?,
                state_vector: row.try_get("state_vector").map_err(StoreError::from)?,
                version: row.try_get("version").map_err(StoreError::from)?,
            })),
            None => Ok(None),
        }
    }

    async fn write_snapshot(
        &self,
        room_id: &str,
        payload: Vec<u8>,
        state_vector: Vec<u8>,
    ) -> Result<i32, StoreError> {
        // The per-room UNIQUE (room_id, version) constraint turns a racing
        // writer into an AlreadyExists, which the caller's backoff replays
        // against the bumped max.
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO snapshots (id, room_id, payload, state_vector, version) \
             VALUES ($1, $2, $3, $4, \
                     (SELECT COALESCE(MAX(version), 0) + 1 FROM snapshots WHERE room_id = $2)) \
             RETURNING version",
        )
        .bind(Uuid::new_v4())
        .bind(room_id)
        .bind(payload)
        .bind(state_vector)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::AlreadyExists => StoreError::Unavailable("snapshot version race".into()),
            other => other,
        })?;
        tx.commit().await?;

        let version: i32 = row.try_get("version").map_err(StoreError::from)?;
        Ok(version)
    }

    async fn prune_snapshots(&self, room_id: &str, keep: u32) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM snapshots \
             WHERE room_id = $1 AND version NOT IN \
                (SELECT version FROM snapshots WHERE room_id = $1 \
                 ORDER BY version DESC LIMIT $2)",
        )
        .bind(room_id)
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_snapshots(
        &self,
        room_id: &str,
        limit: u32,
    ) -> Result<Vec<SnapshotMeta>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, room_id, version, OCTET_LENGTH(payload) AS size, created_at \
             FROM snapshots WHERE room_id = $1 \
             ORDER BY version DESC LIMIT $2",
        )
        .bind(room_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SnapshotMeta {
                    id: row.try_get("id").map_err(StoreError::from)?,
                    room_id: row.try_get("room_id").map_err(StoreError::from)?,
                    version: row.try_get("version").map_err(StoreError::from)?,
                    size: row.try_get::<i32, _>("size").map_err(StoreError::from)? as i64,
                    created_at: row.try_get("created_at").map_err(StoreError::from)?,
                })
            })
            .collect()
    }
}
