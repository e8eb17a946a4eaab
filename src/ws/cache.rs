use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::db::{with_backoff, RoomStore, StoreError};
use crate::models::{
    JoinFrame, LeaveFrame, ParticipantEntry, ServerFrame, UpdateRelayFrame,
    SyncResponseFrame,
};
use crate::ws::doc::RoomDoc;
use crate::ws::registry::{ClientId, CloseReason, Registry, SessionHandle};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub snapshot_interval: Duration,
    pub snapshot_keep: u32,
    pub idle_destroy_grace: Duration,
    pub apply_queue: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(30),
            snapshot_keep: 10,
            idle_destroy_grace: Duration::from_secs(60),
            apply_queue: 1024,
        }
    }
}

#[derive(Debug)]
pub enum JoinError {
    AlreadyAttached,
    /// The document could not produce a snapshot for the joiner
    Document(String),
    /// The room's owner task is gone
    Gone,
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinError::AlreadyAttached => write!(f, "session already attached"),
            JoinError::Document(e) => write!(f, "document failure: {}", e),
            JoinError::Gone => write!(f, "document owner is gone"),
        }
    }
}

impl std::error::Error for JoinError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyError {
    /// The apply mailbox is at capacity; the sender is flooding
    Backlog,
    /// The room's owner task is gone
    Gone,
}

/// Mailbox of a room's owner task. Everything that reaches the room —
/// admission, updates, presence/chat relays, departures, encodes, saves,
/// destruction — is serialized here, so frames from one sender reach every
/// recipient in submission order.
enum DocCmd {
    Join {
        handle: Arc<SessionHandle>,
        reply: oneshot::Sender<Result<(), JoinError>>,
    },
    Apply {
        delta: Vec<u8>,
        from: ClientId,
    },
    Relay {
        frame: ServerFrame,
        except: Option<ClientId>,
    },
    Depart {
        client_id: ClientId,
        user_id: String,
    },
    EncodeFull {
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Save {
        reply: oneshot::Sender<()>,
    },
    Destroy,
}

/// Cheap handle onto one room's owner task.
#[derive(Clone)]
pub struct DocHandle {
    tx: mpsc::Sender<DocCmd>,
}

impl DocHandle {
    /// Admit a session: snapshot the document, attach to the registry with
    /// the sync-response as greeting, and announce the join to peers — all
    /// under the room's serialization point.
    pub async fn join(&self, handle: Arc<SessionHandle>) -> Result<(), JoinError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DocCmd::Join { handle, reply })
            .await
            .map_err(|_| JoinError::Gone)?;
        rx.await.map_err(|_| JoinError::Gone)?
    }

    /// Non-blocking submit of one update. `Backlog` means the sender has
    /// outrun the room's apply cap.
    pub fn try_apply(&self, delta: Vec<u8>, from: ClientId) -> Result<(), ApplyError> {
        self.tx
            .try_send(DocCmd::Apply { delta, from })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ApplyError::Backlog,
                mpsc::error::TrySendError::Closed(_) => ApplyError::Gone,
            })
    }

    /// Non-blocking submit of a presence or chat relay. Rides the same
    /// mailbox as updates so a sender's frames cannot overtake each other.
    pub fn try_relay(&self, frame: ServerFrame, except: Option<ClientId>) -> Result<(), ApplyError> {
        self.tx
            .try_send(DocCmd::Relay { frame, except })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ApplyError::Backlog,
                mpsc::error::TrySendError::Closed(_) => ApplyError::Gone,
            })
    }

    /// Announce a departure to the room. Ordered after every update the
    /// departing session managed to submit.
    pub async fn depart(&self, client_id: ClientId, user_id: String) {
        let _ = self.tx.send(DocCmd::Depart { client_id, user_id }).await;
    }

    /// Full-state serialization of the current document.
    pub async fn encode_full(&self) -> Option<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(DocCmd::EncodeFull { reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Flush to the store if dirty; resolves once the write is durable.
    pub async fn save(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DocCmd::Save { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn destroy(&self) {
        let _ = self.tx.send(DocCmd::Destroy).await;
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct DocActor {
    room_id: String,
    doc: RoomDoc,
    dirty: Arc<AtomicBool>,
    save_inflight: Arc<AtomicBool>,
    store: Arc<dyn RoomStore>,
    registry: Arc<Registry>,
    keep: u32,
}

impl DocActor {
    fn spawn(
        room_id: String,
        doc: RoomDoc,
        store: Arc<dyn RoomStore>,
        registry: Arc<Registry>,
        cfg: &CacheConfig,
    ) -> DocHandle {
        let (tx, rx) = mpsc::channel(cfg.apply_queue);
        let actor = DocActor {
            room_id,
            doc,
            dirty: Arc::new(AtomicBool::new(false)),
            save_inflight: Arc::new(AtomicBool::new(false)),
            store,
            registry,
            keep: cfg.snapshot_keep,
        };
        tokio::spawn(actor.run(rx, cfg.snapshot_interval));
        DocHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DocCmd>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately once; swallow that
        ticker.tick().await;

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    None | Some(DocCmd::Destroy) => {
                        self.persist_if_dirty().await;
                        break;
                    }
                    Some(cmd) => {
                        if !self.handle(cmd).await {
                            break;
                        }
                    }
                },
                _ = ticker.tick() => {
                    if !self.periodic_save().await {
                        break;
                    }
                }
            }
        }
        debug!("document owner for room {} stopped", self.room_id);
    }

    /// Returns false when the document is poisoned and the actor must stop.
    async fn handle(&mut self, cmd: DocCmd) -> bool {
        match cmd {
            DocCmd::Join { handle, reply } => {
                let snapshot = match self.doc.encode_snapshot() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("failed to snapshot room {} for joiner: {}", self.room_id, e);
                        let _ = reply.send(Err(JoinError::Document(e.to_string())));
                        self.poison().await;
                        return false;
                    }
                };

                let mut participants: Vec<ParticipantEntry> = self
                    .registry
                    .room_members(&self.room_id)
                    .await
                    .iter()
                    .map(|member| ParticipantEntry {
                        client_id: member.client_id,
                        user: member.user.clone(),
                        joined_at: member.joined_at,
                    })
                    .collect();
                participants.push(ParticipantEntry {
                    client_id: handle.client_id,
                    user: handle.user.clone(),
                    joined_at: handle.joined_at,
                });

                let greeting = ServerFrame::SyncResponse(SyncResponseFrame {
                    snapshot_data: snapshot,
                    participants,
                });
                let join = ServerFrame::Join(JoinFrame {
                    user: handle.user.clone(),
                    client_id: handle.client_id,
                    room_id: self.room_id.clone(),
                });
                let client_id = handle.client_id;

                if let Err(e) = self.registry.attach(&self.room_id, handle, &greeting).await {
                    warn!("attach rejected for {} in room {}: {}", client_id, self.room_id, e);
                    let _ = reply.send(Err(JoinError::AlreadyAttached));
                    return true;
                }
                self.registry
                    .broadcast(&self.room_id, &join, Some(client_id))
                    .await;
                let _ = reply.send(Ok(()));
            }

            DocCmd::Apply { delta, from } => match self.doc.apply(&delta) {
                Ok(()) => {
                    self.dirty.store(true, Ordering::Release);
                    let frame = ServerFrame::Update(UpdateRelayFrame { delta, from });
                    self.registry.broadcast(&self.room_id, &frame, Some(from)).await;
                }
                Err(e) => {
                    warn!(
                        "rejecting update from {} in room {}: {}",
                        from, self.room_id, e
                    );
                    self.registry.kick(from, CloseReason::DocumentFailed).await;
                }
            },

            DocCmd::Relay { frame, except } => {
                self.registry.broadcast(&self.room_id, &frame, except).await;
            }

            DocCmd::Depart { client_id, user_id } => {
                let frame = ServerFrame::Leave(LeaveFrame { client_id, user_id });
                self.registry
                    .broadcast(&self.room_id, &frame, Some(client_id))
                    .await;
            }

            DocCmd::EncodeFull { reply } => {
                let bytes = match self.doc.encode_snapshot() {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        error!("failed to encode room {}: {}", self.room_id, e);
                        None
                    }
                };
                let _ = reply.send(bytes);
            }

            DocCmd::Save { reply } => {
                self.persist_if_dirty().await;
                let _ = reply.send(());
            }

            DocCmd::Destroy => unreachable!("Destroy is handled by the run loop"),
        }
        true
    }

    /// Encode under the owner, then hand the write to a background task so
    /// applies keep flowing. Skipped while a previous write is in flight.
    async fn periodic_save(&mut self) -> bool {
        if self.save_inflight.load(Ordering::Acquire) {
            return true;
        }
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return true;
        }

        let (payload, state_vector) = match (self.doc.encode_snapshot(), self.doc.state_vector()) {
            (Ok(p), Ok(v)) => (p, v),
            (Err(e), _) | (_, Err(e)) => {
                error!("periodic save failed to encode room {}: {}", self.room_id, e);
                self.poison().await;
                return false;
            }
        };

        self.save_inflight.store(true, Ordering::Release);
        let store = self.store.clone();
        let room_id = self.room_id.clone();
        let keep = self.keep;
        let dirty = self.dirty.clone();
        let inflight = self.save_inflight.clone();
        tokio::spawn(async move {
            match with_backoff("write_snapshot", || {
                let store = store.clone();
                let room_id = room_id.clone();
                let payload = payload.clone();
                let state_vector = state_vector.clone();
                async move { store.write_snapshot(&room_id, payload, state_vector).await }
            })
            .await
            {
                Ok(version) => {
                    debug!("saved snapshot v{} for room {}", version, room_id);
                    if let Err(e) = store.prune_snapshots(&room_id, keep).await {
                        warn!("failed to prune snapshots for room {}: {}", room_id, e);
                    }
                }
                Err(e) => {
                    error!("failed to save snapshot for room {}: {}", room_id, e);
                    // The state is still only in memory; try again next tick.
                    dirty.store(true, Ordering::Release);
                }
            }
            inflight.store(false, Ordering::Release);
        });
        true
    }

    /// Inline flush, used by explicit Save and by the destroy path.
    async fn persist_if_dirty(&mut self) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let (payload, state_vector) = match (self.doc.encode_snapshot(), self.doc.state_vector()) {
            (Ok(p), Ok(v)) => (p, v),
            (Err(e), _) | (_, Err(e)) => {
                error!("final save failed to encode room {}: {}", self.room_id, e);
                return;
            }
        };
        let store = self.store.clone();
        let room_id = self.room_id.clone();
        match with_backoff("write_snapshot", || {
            let store = store.clone();
            let room_id = room_id.clone();
            let payload = payload.clone();
            let state_vector = state_vector.clone();
            async move { store.write_snapshot(&room_id, payload, state_vector).await }
        })
        .await
        {
            Ok(version) => {
                info!("saved snapshot v{} for room {}", version, self.room_id);
                if let Err(e) = self.store.prune_snapshots(&self.room_id, self.keep).await {
                    warn!("failed to prune snapshots for room {}: {}", self.room_id, e);
                }
            }
            Err(e) => {
                error!("failed to save snapshot for room {}: {}", self.room_id, e);
            }
        }
    }

    /// Room-local corruption: close every attached session and discard the
    /// document. The next admission reloads from the last good snapshot.
    async fn poison(&self) {
        for member in self.registry.room_members(&self.room_id).await {
            member.kick(CloseReason::DocumentFailed);
        }
    }
}

struct RoomSlot {
    handle: DocHandle,
    attached: usize,
    destroy: Option<JoinHandle<()>>,
}

/// In-memory documents keyed by room, with load-on-first-join,
/// save-on-interval, and save-on-last-leave semantics.
pub struct DocCache {
    cfg: CacheConfig,
    store: Arc<dyn RoomStore>,
    registry: Arc<Registry>,
    rooms: Mutex<HashMap<String, RoomSlot>>,
}

impl DocCache {
    pub fn new(cfg: CacheConfig, store: Arc<dyn RoomStore>, registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            store,
            registry,
            rooms: Mutex::new(HashMap::new()),
        })
    }

    /// Get the room's document, creating it from the newest snapshot when
    /// absent. A pending destroy is cancelled by re-acquisition.
    pub async fn acquire(self: &Arc<Self>, room_id: &str) -> Result<DocHandle, StoreError> {
        loop {
            {
                let mut rooms = self.rooms.lock().await;
                if let Some(slot) = rooms.get_mut(room_id) {
                    if slot.handle.is_closed() {
                        // Poisoned owner; drop the slot and rebuild below.
                        rooms.remove(room_id);
                    } else {
                        slot.attached += 1;
                        if let Some(pending) = slot.destroy.take() {
                            pending.abort();
                        }
                        return Ok(slot.handle.clone());
                    }
                }
            }

            // Load outside the lock; re-check for a racing creator after.
            let doc = match self.store.newest_snapshot(room_id).await? {
                Some(snapshot) => {
                    debug!(
                        "seeding room {} from snapshot v{} ({} bytes)",
                        room_id,
                        snapshot.version,
                        snapshot.payload.len()
                    );
                    RoomDoc::from_snapshot(&snapshot.payload).map_err(|e| {
                        StoreError::Fatal(format!("corrupt snapshot for room {}: {}", room_id, e))
                    })?
                }
                None => RoomDoc::new(),
            };

            let mut rooms = self.rooms.lock().await;
            if rooms.contains_key(room_id) {
                continue;
            }
            let handle = DocActor::spawn(
                room_id.to_string(),
                doc,
                self.store.clone(),
                self.registry.clone(),
                &self.cfg,
            );
            rooms.insert(
                room_id.to_string(),
                RoomSlot {
                    handle: handle.clone(),
                    attached: 1,
                    destroy: None,
                },
            );
            return Ok(handle);
        }
    }

    /// Drop one attachment. The last one out schedules a final save and
    /// destroy after the configured grace.
    pub async fn release(self: &Arc<Self>, room_id: &str) {
        let mut rooms = self.rooms.lock().await;
        let Some(slot) = rooms.get_mut(room_id) else {
            return;
        };
        slot.attached = slot.attached.saturating_sub(1);
        if slot.attached == 0 && slot.destroy.is_none() {
            let cache = Arc::clone(self);
            let room = room_id.to_string();
            let grace = self.cfg.idle_destroy_grace;
            slot.destroy = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                cache.finalize(&room).await;
            }));
        }
    }

    /// Grace expired with no attachments: flush, then drop the document.
    async fn finalize(&self, room_id: &str) {
        let handle = {
            let rooms = self.rooms.lock().await;
            match rooms.get(room_id) {
                Some(slot) if slot.attached == 0 => slot.handle.clone(),
                _ => return,
            }
        };
        // Flush before removal so a racing acquire always finds either the
        // live document or its persisted state.
        handle.save().await;

        let removed = {
            let mut rooms = self.rooms.lock().await;
            match rooms.get(room_id) {
                Some(slot) if slot.attached == 0 => rooms.remove(room_id),
                _ => None,
            }
        };
        if let Some(slot) = removed {
            slot.handle.destroy().await;
            debug!("destroyed idle document for room {}", room_id);
        }
    }

    pub async fn live_documents(&self) -> usize {
        self.rooms.lock().await.len()
    }

    pub async fn attached_count(&self, room_id: &str) -> Option<usize> {
        self.rooms.lock().await.get(room_id).map(|s| s.attached)
    }

    /// Flush every dirty document and stop all owners. Shutdown path.
    pub async fn shutdown(&self) {
        let slots: Vec<(String, RoomSlot)> = self.rooms.lock().await.drain().collect();
        for (room_id, slot) in slots {
            if let Some(pending) = slot.destroy {
                pending.abort();
            }
            slot.handle.save().await;
            slot.handle.destroy().await;
            debug!("flushed document for room {}", room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemStore;
    use loro::{ExportMode, LoroDoc};
    use uuid::Uuid;

    fn update_with_text(text: &str) -> Vec<u8> {
        let doc = LoroDoc::new();
        doc.get_text("t").insert(0, text).unwrap();
        doc.export(ExportMode::Snapshot).unwrap()
    }

    fn cache_with(grace_ms: u64) -> (Arc<DocCache>, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        let registry = Arc::new(Registry::new());
        let cfg = CacheConfig {
            snapshot_interval: Duration::from_secs(3600),
            idle_destroy_grace: Duration::from_millis(grace_ms),
            ..CacheConfig::default()
        };
        (
            DocCache::new(cfg, store.clone() as Arc<dyn RoomStore>, registry),
            store,
        )
    }

    #[tokio::test]
    async fn acquire_counts_and_release_never_goes_negative() {
        let (cache, _store) = cache_with(10_000);
        cache.acquire("r1").await.unwrap();
        cache.acquire("r1").await.unwrap();
        assert_eq!(cache.attached_count("r1").await, Some(2));

        cache.release("r1").await;
        assert_eq!(cache.attached_count("r1").await, Some(1));
        cache.release("r1").await;
        cache.release("r1").await;
        assert_eq!(cache.attached_count("r1").await, Some(0));
        assert_eq!(cache.live_documents().await, 1);
    }

    #[tokio::test]
    async fn last_release_destroys_after_grace_and_flushes() {
        let (cache, store) = cache_with(50);
        let doc = cache.acquire("r1").await.unwrap();
        doc.try_apply(update_with_text("persist me"), Uuid::new_v4())
            .unwrap();
        cache.release("r1").await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cache.live_documents().await, 0);

        let snapshot = store.newest_snapshot("r1").await.unwrap().unwrap();
        assert_eq!(snapshot.version, 1);
        let restored = RoomDoc::from_snapshot(&snapshot.payload).unwrap();
        assert_eq!(restored.to_json()["t"], "persist me");
    }

    #[tokio::test]
    async fn reacquire_during_grace_cancels_destroy() {
        let (cache, _store) = cache_with(150);
        cache.acquire("r1").await.unwrap();
        cache.release("r1").await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        cache.acquire("r1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(cache.live_documents().await, 1);
        assert_eq!(cache.attached_count("r1").await, Some(1));
    }

    #[tokio::test]
    async fn acquire_seeds_from_newest_snapshot() {
        let (cache, store) = cache_with(10_000);
        let seeded = RoomDoc::new();
        seeded.apply(&update_with_text("from disk")).unwrap();
        store
            .write_snapshot(
                "r1",
                seeded.encode_snapshot().unwrap(),
                seeded.state_vector().unwrap(),
            )
            .await
            .unwrap();

        let doc = cache.acquire("r1").await.unwrap();
        let bytes = doc.encode_full().await.unwrap();
        let loaded = RoomDoc::from_snapshot(&bytes).unwrap();
        assert_eq!(loaded.to_json()["t"], "from disk");
    }

    #[tokio::test]
    async fn explicit_save_writes_once_and_clears_dirty() {
        let (cache, store) = cache_with(10_000);
        let doc = cache.acquire("r1").await.unwrap();
        doc.try_apply(update_with_text("v1"), Uuid::new_v4()).unwrap();
        doc.save().await;
        doc.save().await; // clean, must not write a second version
        let metas = store.list_snapshots("r1", 10).await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].version, 1);
    }

    #[tokio::test]
    async fn apply_backlog_surfaces_as_flood() {
        // Current-thread test runtime: the owner task cannot run while this
        // future stays un-awaited, so the mailbox genuinely fills.
        let store = Arc::new(MemStore::new());
        let registry = Arc::new(Registry::new());
        let cfg = CacheConfig {
            apply_queue: 4,
            snapshot_interval: Duration::from_secs(3600),
            ..CacheConfig::default()
        };
        let cache = DocCache::new(cfg, store as Arc<dyn RoomStore>, registry);
        let doc = cache.acquire("r1").await.unwrap();

        let sender = Uuid::new_v4();
        let mut backlogged = false;
        for _ in 0..16 {
            match doc.try_apply(update_with_text("x"), sender) {
                Ok(()) => {}
                Err(ApplyError::Backlog) => {
                    backlogged = true;
                    break;
                }
                Err(other) => panic!("unexpected apply error: {other:?}"),
            }
        }
        assert!(backlogged);
    }

    #[tokio::test]
    async fn shutdown_flushes_all_dirty_documents() {
        let (cache, store) = cache_with(10_000);
        let a = cache.acquire("a").await.unwrap();
        let b = cache.acquire("b").await.unwrap();
        a.try_apply(update_with_text("alpha"), Uuid::new_v4()).unwrap();
        b.try_apply(update_with_text("beta"), Uuid::new_v4()).unwrap();

        cache.shutdown().await;
        assert_eq!(cache.live_documents().await, 0);
        assert!(store.newest_snapshot("a").await.unwrap().is_some());
        assert!(store.newest_snapshot("b").await.unwrap().is_some());
    }
}
