use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::db::store::{RoomStore, StoreError};
use crate::models::{
    ParticipantRecord, Room, SnapshotMeta, SnapshotRecord, UserInfo, Visibility,
};

/// In-memory repository. Backs storeless deployments and the test suites;
/// semantics mirror [`crate::db::PgStore`] including soft delete.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, (Room, bool)>,
    participants: Vec<ParticipantRecord>,
    snapshots: HashMap<String, Vec<StoredSnapshot>>,
}

struct StoredSnapshot {
    id: Uuid,
    payload: Vec<u8>,
    state_vector: Vec<u8>,
    version: i32,
    created_at: DateTime<Utc>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open participant rows, for assertions and the shutdown sweep.
    pub fn open_participants(&self) -> Vec<ParticipantRecord> {
        let inner = self.inner.lock().expect("memstore poisoned");
        inner
            .participants
            .iter()
            .filter(|p| p.left_at.is_none())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RoomStore for MemStore {
    async fn find_room(&self, id: &str) -> Result<Option<Room>, StoreError> {
        let inner = self.inner.lock().expect("memstore poisoned");
        Ok(inner
            .rooms
            .get(id)
            .filter(|(_, deleted)| !deleted)
            .map(|(room, _)| room.clone()))
    }

    async fn create_room(
        &self,
        id: &str,
        name: &str,
        creator_id: &str,
        visibility: Visibility,
    ) -> Result<Room, StoreError> {
        let mut inner = self.inner.lock().expect("memstore poisoned");
        if inner.rooms.contains_key(id) {
            return Err(StoreError::AlreadyExists);
        }
        let now = Utc::now();
        let room = Room {
            id: id.to_string(),
            name: name.to_string(),
            creator_id: creator_id.to_string(),
            visibility,
            created_at: now,
            last_active: now,
        };
        inner.rooms.insert(id.to_string(), (room.clone(), false));
        Ok(room)
    }

    async fn update_room(
        &self,
        id: &str,
        name: Option<&str>,
        visibility: Option<Visibility>,
    ) -> Result<Room, StoreError> {
        let mut inner = self.inner.lock().expect("memstore poisoned");
        let (room, deleted) = inner.rooms.get_mut(id).ok_or(StoreError::NotFound)?;
        if *deleted {
            return Err(StoreError::NotFound);
        }
        if let Some(name) = name {
            room.name = name.to_string();
        }
        if let Some(visibility) = visibility {
            room.visibility = visibility;
        }
        Ok(room.clone())
    }

    async fn delete_room(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memstore poisoned");
        match inner.rooms.get_mut(id) {
            Some((_, deleted)) if !*deleted => {
                *deleted = true;
                Ok(())
            }
            _ => Err(StoreError::NotFound),
        }
    }

    async fn touch_room(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memstore poisoned");
        if let Some((room, _)) = inner.rooms.get_mut(id) {
            room.last_active = room.last_active.max(now);
        }
        Ok(())
    }

    async fn record_join(
        &self,
        room_id: &str,
        user: &UserInfo,
        client_id: Uuid,
        role: &str,
    ) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.lock().expect("memstore poisoned");
        let id = Uuid::new_v4();
        inner.participants.push(ParticipantRecord {
            id,
            room_id: room_id.to_string(),
            user_id: user.id.clone(),
            client_id,
            user_name: user.name.clone(),
            user_color: user.color.clone(),
            role: role.to_string(),
            joined_at: Utc::now(),
            left_at: None,
        });
        Ok(id)
    }

    async fn record_leave(&self, client_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memstore poisoned");
        for p in inner
            .participants
            .iter_mut()
            .filter(|p| p.client_id == client_id && p.left_at.is_none())
        {
            p.left_at = Some(now);
        }
        Ok(())
    }

    async fn close_stale_participants(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("memstore poisoned");
        let mut closed = 0;
        for p in inner.participants.iter_mut().filter(|p| p.left_at.is_none()) {
            p.left_at = Some(now);
            closed += 1;
        }
        Ok(closed)
    }

    async fn newest_snapshot(&self, room_id: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        let inner = self.inner.lock().expect("memstore poisoned");
        Ok(inner
            .snapshots
            .get(room_id)
            .and_then(|list| list.iter().max_by_key(|s| s.version))
            .map(|s| SnapshotRecord {
                payload: s.payload.clone(),
                state_vector: s.state_vector.clone(),
                version: s.version,
            }))
    }

    async fn write_snapshot(
        &self,
        room_id: &str,
        payload: Vec<u8>,
        state_vector: Vec<u8>,
    ) -> Result<i32, StoreError> {
        let mut inner = self.inner.lock().expect("memstore poisoned");
        let list = inner.snapshots.entry(room_id.to_string()).or_default();
        let version = list.iter().map(|s| s.version).max().unwrap_or(0) + 1;
        list.push(StoredSnapshot {
            id: Uuid::new_v4(),
            payload,
            state_vector,
            version,
            created_at: Utc::now(),
        });
        Ok(version)
    }

    async fn prune_snapshots(&self, room_id: &str, keep: u32) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("memstore poisoned");
        let Some(list) = inner.snapshots.get_mut(room_id) else {
            return Ok(0);
        };
        if list.len() <= keep as usize {
            return Ok(0);
        }
        list.sort_by_key(|s| std::cmp::Reverse(s.version));
        let dropped = list.split_off(keep as usize);
        Ok(dropped.len() as u64)
    }

    async fn list_snapshots(
        &self,
        room_id: &str,
        limit: u32,
    ) -> Result<Vec<SnapshotMeta>, StoreError> {
        let inner = self.inner.lock().expect("memstore poisoned");
        let mut metas: Vec<SnapshotMeta> = inner
            .snapshots
            .get(room_id)
            .map(|list| {
                list.iter()
                    .map(|s| SnapshotMeta {
                        id: s.id,
                        room_id: room_id.to_string(),
                        version: s.version,
                        size: s.payload.len() as i64,
                        created_at: s.created_at,
                    })
                    .collect()
            })
            .unwrap_or_default();
        metas.sort_by_key(|m| std::cmp::Reverse(m.version));
        metas.truncate(limit as usize);
        Ok(metas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserInfo {
        UserInfo {
            id: "u1".into(),
            name: "Ada".into(),
            color: "#f00".into(),
        }
    }

    #[tokio::test]
    async fn create_room_rejects_duplicate_id() {
        let store = MemStore::new();
        store
            .create_room("r1", "Room", "u1", Visibility::Public)
            .await
            .unwrap();
        let dup = store.create_room("r1", "Other", "u2", Visibility::Private).await;
        assert!(matches!(dup, Err(StoreError::AlreadyExists)));
    }

    #[tokio::test]
    async fn deleted_room_is_invisible_but_blocks_recreate() {
        let store = MemStore::new();
        store
            .create_room("r1", "Room", "u1", Visibility::Public)
            .await
            .unwrap();
        store.delete_room("r1").await.unwrap();
        assert!(store.find_room("r1").await.unwrap().is_none());
        assert!(matches!(
            store.create_room("r1", "Room", "u1", Visibility::Public).await,
            Err(StoreError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn snapshot_versions_are_monotonic_and_pruned() {
        let store = MemStore::new();
        store
            .create_room("r1", "Room", "u1", Visibility::Public)
            .await
            .unwrap();
        for i in 0..12u8 {
            let version = store
                .write_snapshot("r1", vec![i], vec![])
                .await
                .unwrap();
            assert_eq!(version, i as i32 + 1);
        }
        let dropped = store.prune_snapshots("r1", 10).await.unwrap();
        assert_eq!(dropped, 2);

        let metas = store.list_snapshots("r1", 100).await.unwrap();
        assert_eq!(metas.len(), 10);
        assert_eq!(metas[0].version, 12);
        assert_eq!(metas[9].version, 3);

        let newest = store.newest_snapshot("r1").await.unwrap().unwrap();
        assert_eq!(newest.version, 12);
        assert_eq!(newest.payload, vec![11]);
    }

    #[tokio::test]
    async fn prune_at_exactly_keep_is_a_noop() {
        let store = MemStore::new();
        for _ in 0..10 {
            store.write_snapshot("r1", vec![0], vec![]).await.unwrap();
        }
        assert_eq!(store.prune_snapshots("r1", 10).await.unwrap(), 0);
        assert_eq!(store.list_snapshots("r1", 100).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn record_leave_is_idempotent() {
        let store = MemStore::new();
        let client = Uuid::new_v4();
        store.record_join("r1", &user(), client, "editor").await.unwrap();
        let t1 = Utc::now();
        store.record_leave(client, t1).await.unwrap();
        store.record_leave(client, Utc::now()).await.unwrap();

        let inner = store.inner.lock().unwrap();
        assert_eq!(inner.participants.len(), 1);
        assert_eq!(inner.participants[0].left_at, Some(t1));
    }

    #[tokio::test]
    async fn close_stale_participants_closes_every_open_row() {
        let store = MemStore::new();
        store.record_join("r1", &user(), Uuid::new_v4(), "editor").await.unwrap();
        store.record_join("r2", &user(), Uuid::new_v4(), "editor").await.unwrap();
        assert_eq!(store.close_stale_participants(Utc::now()).await.unwrap(), 2);
        assert!(store.open_participants().is_empty());
    }
}
