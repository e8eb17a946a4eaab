use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{ErrorCode, ServerFrame, UserInfo};
use crate::ws::codec;

pub type ClientId = Uuid;

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Outbound queue overflowed or a write missed its deadline
    Overflow,
    /// Apply mailbox overflowed
    Flood,
    IdleTimeout,
    /// The room's document rejected this session's update
    DocumentFailed,
    Shutdown,
}

impl CloseReason {
    /// The error frame to send before closing, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            CloseReason::Overflow | CloseReason::Flood => Some(ErrorCode::Flood),
            CloseReason::DocumentFailed => Some(ErrorCode::Internal),
            CloseReason::IdleTimeout | CloseReason::Shutdown => None,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CloseReason::Overflow => "outbound queue overflow",
            CloseReason::Flood => "update flood",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::DocumentFailed => "document failure",
            CloseReason::Shutdown => "server shutting down",
        }
    }
}

/// Signal teardown on a session's kick channel. The first reason wins;
/// later signals are no-ops.
pub fn signal_kick(tx: &watch::Sender<Option<CloseReason>>, reason: CloseReason) {
    tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

/// The registry's shared view of one live session: its outbound queue plus
/// a kick signal. The session task owns everything else.
pub struct SessionHandle {
    pub client_id: ClientId,
    pub user: UserInfo,
    pub joined_at: DateTime<Utc>,
    outbound: mpsc::Sender<Message>,
    kick: Arc<watch::Sender<Option<CloseReason>>>,
}

impl SessionHandle {
    pub fn new(
        client_id: ClientId,
        user: UserInfo,
        outbound: mpsc::Sender<Message>,
        kick: Arc<watch::Sender<Option<CloseReason>>>,
    ) -> Self {
        Self {
            client_id,
            user,
            joined_at: Utc::now(),
            outbound,
            kick,
        }
    }

    /// Non-blocking enqueue onto the session's bounded outbound queue.
    pub fn enqueue_text(&self, text: String) -> Result<(), mpsc::error::TrySendError<Message>> {
        self.outbound.try_send(Message::Text(text))
    }

    pub fn enqueue(&self, frame: &ServerFrame) -> Result<(), mpsc::error::TrySendError<Message>> {
        self.enqueue_text(codec::encode_frame(frame))
    }

    /// Signal teardown. The first reason wins; later kicks are no-ops.
    pub fn kick(&self, reason: CloseReason) {
        signal_kick(&self.kick, reason);
    }
}

#[derive(Debug)]
pub enum AttachError {
    AlreadyAttached,
}

impl std::fmt::Display for AttachError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachError::AlreadyAttached => write!(f, "session is already attached to a room"),
        }
    }
}

impl std::error::Error for AttachError {}

#[derive(Default)]
struct Inner {
    sessions: HashMap<ClientId, (String, Arc<SessionHandle>)>,
    rooms: HashMap<String, HashSet<ClientId>>,
}

/// Process-wide index of live sessions: `client_id → session` plus a
/// per-room membership view. Reads (broadcast, stats) dominate writes
/// (attach/detach), hence the RwLock.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
    frames_relayed: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session into both indexes and deliver its greeting frame
    /// while the write lock is held. Holding the lock is what guarantees a
    /// joiner sees its sync-response before any broadcast enqueued after
    /// admission.
    pub async fn attach(
        &self,
        room_id: &str,
        handle: Arc<SessionHandle>,
        greeting: &ServerFrame,
    ) -> Result<(), AttachError> {
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&handle.client_id) {
            return Err(AttachError::AlreadyAttached);
        }
        let client_id = handle.client_id;
        if handle.enqueue(greeting).is_err() {
            // A freshly created queue only rejects when the writer is gone.
            warn!("greeting rejected by fresh session queue, kicking {}", client_id);
            handle.kick(CloseReason::Overflow);
        }
        inner
            .sessions
            .insert(client_id, (room_id.to_string(), handle));
        inner
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(client_id);
        Ok(())
    }

    /// Remove a session from both indexes. Idempotent.
    pub async fn detach(&self, client_id: ClientId) -> Option<(String, Arc<SessionHandle>)> {
        let mut inner = self.inner.write().await;
        let (room_id, handle) = inner.sessions.remove(&client_id)?;
        if let Some(bucket) = inner.rooms.get_mut(&room_id) {
            bucket.remove(&client_id);
            if bucket.is_empty() {
                inner.rooms.remove(&room_id);
            }
        }
        Some((room_id, handle))
    }

    /// Enqueue a frame to every member of a room, skipping `except`.
    ///
    /// Never blocks on a slow receiver: a full or closed queue marks that
    /// session for teardown and the fan-out continues.
    pub async fn broadcast(&self, room_id: &str, frame: &ServerFrame, except: Option<ClientId>) {
        let text = codec::encode_frame(frame);
        let inner = self.inner.read().await;
        let Some(bucket) = inner.rooms.get(room_id) else {
            return;
        };
        for client_id in bucket {
            if Some(*client_id) == except {
                continue;
            }
            let Some((_, handle)) = inner.sessions.get(client_id) else {
                continue;
            };
            match handle.enqueue_text(text.clone()) {
                Ok(()) => {
                    self.frames_relayed.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    debug!("outbound queue rejected frame, kicking {}", client_id);
                    handle.kick(CloseReason::Overflow);
                }
            }
        }
    }

    /// Snapshot of a room's membership.
    pub async fn room_members(&self, room_id: &str) -> Vec<Arc<SessionHandle>> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(room_id)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter_map(|id| inner.sessions.get(id))
                    .map(|(_, handle)| handle.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn kick(&self, client_id: ClientId, reason: CloseReason) -> bool {
        let inner = self.inner.read().await;
        match inner.sessions.get(&client_id) {
            Some((_, handle)) => {
                handle.kick(reason);
                true
            }
            None => false,
        }
    }

    pub async fn kick_all(&self, reason: CloseReason) {
        let inner = self.inner.read().await;
        for (_, handle) in inner.sessions.values() {
            handle.kick(reason);
        }
    }

    /// Force-remove every session, for the shutdown path after the drain
    /// deadline expires.
    pub async fn drain(&self) -> Vec<(String, Arc<SessionHandle>)> {
        let mut inner = self.inner.write().await;
        inner.rooms.clear();
        inner.sessions.drain().map(|(_, v)| v).collect()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    pub fn frames_relayed(&self) -> u64 {
        self.frames_relayed.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    async fn indexes_agree(&self) -> bool {
        let inner = self.inner.read().await;
        let by_room: usize = inner.rooms.values().map(|b| b.len()).sum();
        by_room == inner.sessions.len()
            && inner.rooms.values().all(|b| !b.is_empty())
            && inner.sessions.iter().all(|(id, (room, _))| {
                inner.rooms.get(room).map(|b| b.contains(id)).unwrap_or(false)
            })
    }
}
