use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{with_backoff, RoomStore, StoreError};
use crate::models::{
    ChatRelayFrame, ClientFrame, ConnectFrame, ErrorCode, ServerFrame, UserInfo, Visibility,
    ROLE_EDITOR,
};
use crate::utils::ScopeGuard;
use crate::ws::cache::{ApplyError, DocHandle};
use crate::ws::codec::{self, DecodeError};
use crate::ws::hub::Hub;
use crate::ws::registry::{signal_kick, ClientId, CloseReason, SessionHandle};

/// Deadline for a single socket write; exceedance closes the session.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Lifecycle of one connection. Pending until a valid connect, Active until
/// leave/close/kick; the teardown after the read loop is the Closing state.
enum Phase {
    Pending,
    Active(ActiveCtx),
}

struct ActiveCtx {
    room_id: String,
    user: UserInfo,
    doc: DocHandle,
}

enum Flow {
    Continue,
    Close(Option<CloseReason>),
}

/// Drive one socket from accept to close.
pub async fn run_session(socket: WebSocket, hub: Arc<Hub>) {
    let client_id = Uuid::new_v4();
    hub.connection_opened();
    // Runs even if this task unwinds, so the drain gauge cannot leak.
    let _gauge = ScopeGuard::new({
        let hub = hub.clone();
        move || hub.session_finished()
    });

    let (out_tx, out_rx) = mpsc::channel::<Message>(hub.cfg().outbound_queue);
    let (kick_tx, kick_rx) = watch::channel::<Option<CloseReason>>(None);
    let kick = Arc::new(kick_tx);

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(
        sink,
        out_rx,
        kick_rx.clone(),
        kick.clone(),
        hub.cfg().heartbeat_interval,
    ));

    let mut session = Session {
        client_id,
        hub: hub.clone(),
        out_tx: out_tx.clone(),
        kick,
        phase: Phase::Pending,
    };
    let reason = session.read_loop(stream, kick_rx).await;
    session.close(reason).await;

    // All senders gone: the writer drains what is queued and closes.
    drop(session);
    drop(out_tx);
    if timeout(WRITE_DEADLINE, &mut writer).await.is_err() {
        writer.abort();
    }
    debug!("session {} closed ({:?})", client_id, reason);
}

/// Closing-state side effects, in the order the ordering guarantees need:
/// detach (stop receiving), announce the leave through the room's owner so
/// peers see it after this session's last update, record the departure,
/// release the document.
async fn teardown(hub: &Arc<Hub>, client_id: ClientId, ctx: ActiveCtx, reason: Option<CloseReason>) {
    info!(
        "client {} leaving room {} ({})",
        client_id,
        ctx.room_id,
        reason.map(|r| r.message()).unwrap_or("connection closed")
    );
    hub.registry().detach(client_id).await;
    ctx.doc.depart(client_id, ctx.user.id.clone()).await;

    let store = hub.store();
    tokio::spawn(async move {
        let result = with_backoff("record_leave", || {
            let store = store.clone();
            async move { store.record_leave(client_id, Utc::now()).await }
        })
        .await;
        if let Err(e) = result {
            error!("failed to record leave for {}: {}", client_id, e);
        }
    });

    hub.cache().release(&ctx.room_id).await;
}

/// Drain the outbound queue to the socket in FIFO order. A kick preempts the
/// queue: the reason's error frame (if any) goes out, then the socket closes.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Message>,
    mut kick_rx: watch::Receiver<Option<CloseReason>>,
    kick: Arc<watch::Sender<Option<CloseReason>>>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            changed = kick_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let reason = *kick_rx.borrow_and_update();
                if let Some(reason) = reason {
                    if let Some(code) = reason.error_code() {
                        let frame = ServerFrame::error(code, reason.message());
                        let text = codec::encode_frame(&frame);
                        let _ = timeout(WRITE_DEADLINE, sink.send(Message::Text(text))).await;
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            msg = out_rx.recv() => match msg {
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Some(msg) => match timeout(WRITE_DEADLINE, sink.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        // Socket is dead; the read side will notice shortly.
                        debug!("socket write failed: {}", e);
                        break;
                    }
                    Err(_) => {
                        signal_kick(&kick, CloseReason::Overflow);
                        break;
                    }
                },
            },
            _ = ping.tick() => {
                match timeout(WRITE_DEADLINE, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }
}

struct Session {
    client_id: ClientId,
    hub: Arc<Hub>,
    out_tx: mpsc::Sender<Message>,
    kick: Arc<watch::Sender<Option<CloseReason>>>,
    phase: Phase,
}

impl Drop for Session {
    fn drop(&mut self) {
        // Unwind safety net: a panicking read loop never reaches close(),
        // and a leaked attachment would pin the registry entry and the
        // room's document forever.
        if let Phase::Active(ctx) = std::mem::replace(&mut self.phase, Phase::Pending) {
            let hub = self.hub.clone();
            let client_id = self.client_id;
            tokio::spawn(async move {
                teardown(&hub, client_id, ctx, None).await;
            });
        }
    }
}

impl Session {
    /// Closing side effects on the clean exit path. Taking the context out
    /// of the phase is the exactly-once guard shared with Drop.
    async fn close(&mut self, reason: Option<CloseReason>) {
        if let Phase::Active(ctx) = std::mem::replace(&mut self.phase, Phase::Pending) {
            teardown(&self.hub, self.client_id, ctx, reason).await;
        }
    }

    async fn read_loop(
        &mut self,
        mut stream: SplitStream<WebSocket>,
        mut kick_rx: watch::Receiver<Option<CloseReason>>,
    ) -> Option<CloseReason> {
        let idle_timeout = self.hub.cfg().idle_timeout;
        loop {
            tokio::select! {
                changed = kick_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    if let Some(reason) = *kick_rx.borrow_and_update() {
                        return Some(reason);
                    }
                }
                next = timeout(idle_timeout, stream.next()) => match next {
                    Err(_) => {
                        // Let the writer close the socket.
                        signal_kick(&self.kick, CloseReason::IdleTimeout);
                        return Some(CloseReason::IdleTimeout);
                    }
                    Ok(None) => return None,
                    Ok(Some(Err(e))) => {
                        debug!("socket error for {}: {}", self.client_id, e);
                        return None;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => match self.handle_text(&text).await {
                        Flow::Continue => {}
                        Flow::Close(reason) => return reason,
                    },
                    Ok(Some(Ok(Message::Binary(_)))) => {
                        self.send_error(ErrorCode::InvalidMessage, "binary frames are not supported");
                    }
                    Ok(Some(Ok(Message::Close(_)))) => return None,
                    Ok(Some(Ok(_))) => {} // ping/pong control frames
                },
            }
        }
    }

    async fn handle_text(&mut self, text: &str) -> Flow {
        let frame = match codec::decode_frame(text, self.hub.cfg().max_frame_bytes) {
            Ok(frame) => frame,
            Err(e @ DecodeError::Oversized { .. }) => {
                warn!("closing {}: {}", self.client_id, e);
                self.send_error(ErrorCode::InvalidMessage, e.to_string());
                return Flow::Close(None);
            }
            Err(DecodeError::Malformed(e)) => {
                debug!("malformed frame from {}: {}", self.client_id, e);
                self.send_error(ErrorCode::InvalidMessage, "unrecognized frame");
                return Flow::Continue;
            }
        };

        match frame {
            ClientFrame::Connect(connect) => match self.phase {
                Phase::Pending => self.handshake(connect).await,
                Phase::Active(_) => {
                    self.send_error(ErrorCode::AlreadyConnected, "connect already completed");
                    Flow::Continue
                }
            },
            ClientFrame::Update(update) => match &self.phase {
                Phase::Active(ctx) => {
                    let submitted = ctx.doc.try_apply(update.delta, self.client_id);
                    self.submitted(submitted)
                }
                Phase::Pending => self.not_connected(),
            },
            ClientFrame::Presence(mut presence) => match &self.phase {
                Phase::Active(ctx) => {
                    presence.client_id = self.client_id.to_string();
                    // Relays go through the room's owner so they cannot
                    // overtake an update still queued in its mailbox.
                    let submitted = ctx
                        .doc
                        .try_relay(ServerFrame::Presence(presence), Some(self.client_id));
                    self.submitted(submitted)
                }
                Phase::Pending => self.not_connected(),
            },
            ClientFrame::Chat(chat) => match &self.phase {
                Phase::Active(ctx) => {
                    let relay = ServerFrame::Chat(ChatRelayFrame {
                        user_name: chat.user_name,
                        message: chat.message,
                        timestamp: chat.timestamp,
                        client_id: self.client_id,
                    });
                    // Chat echoes back to the sender as well.
                    let submitted = ctx.doc.try_relay(relay, None);
                    self.submitted(submitted)
                }
                Phase::Pending => self.not_connected(),
            },
            ClientFrame::Heartbeat(beat) => match self.phase {
                Phase::Active(_) => {
                    if !self.send(&ServerFrame::Heartbeat(beat)) {
                        signal_kick(&self.kick, CloseReason::Overflow);
                        return Flow::Close(Some(CloseReason::Overflow));
                    }
                    Flow::Continue
                }
                Phase::Pending => self.not_connected(),
            },
            ClientFrame::Leave => match self.phase {
                Phase::Active(_) => Flow::Close(None),
                Phase::Pending => self.not_connected(),
            },
        }
    }

    /// The Pending → Active transition: ensure the room, record the join,
    /// pull the document in, and get admitted under the room's owner.
    async fn handshake(&mut self, connect: ConnectFrame) -> Flow {
        let store = self.hub.store();
        let ConnectFrame { room_id, user, token } = connect;
        if token.is_some() {
            // Tokens are carried by the protocol but admission is currently
            // unconditional; UNAUTHORIZED stays reserved.
            debug!("ignoring connect token from {}", self.client_id);
        }

        let room = match self.ensure_room(&store, &room_id, &user).await {
            Ok(room) => room,
            Err(flow) => return flow,
        };

        // last_active bumps are silent and must never fail the handshake.
        {
            let store = store.clone();
            let room_id = room.id.clone();
            tokio::spawn(async move {
                let result = with_backoff("touch_room", || {
                    let store = store.clone();
                    let room_id = room_id.clone();
                    async move { store.touch_room(&room_id, Utc::now()).await }
                })
                .await;
                if let Err(e) = result {
                    warn!("failed to touch room: {}", e);
                }
            });
        }

        if let Err(e) = store
            .record_join(&room.id, &user, self.client_id, ROLE_EDITOR)
            .await
        {
            error!("failed to record join for {}: {}", self.client_id, e);
            self.send_error(ErrorCode::Internal, "persistence failure");
            return Flow::Close(None);
        }

        let doc = match self.hub.cache().acquire(&room.id).await {
            Ok(doc) => doc,
            Err(e) => {
                error!("failed to load document for room {}: {}", room.id, e);
                self.record_leave_in_background();
                self.send_error(ErrorCode::Internal, "failed to load document");
                return Flow::Close(None);
            }
        };

        let handle = Arc::new(SessionHandle::new(
            self.client_id,
            user.clone(),
            self.out_tx.clone(),
            self.kick.clone(),
        ));
        if let Err(e) = doc.join(handle).await {
            error!("admission failed for {} in room {}: {}", self.client_id, room.id, e);
            self.hub.cache().release(&room.id).await;
            self.record_leave_in_background();
            self.send_error(ErrorCode::Internal, "admission failed");
            return Flow::Close(None);
        }

        info!(
            "client {} ({}) joined room {}",
            self.client_id, user.name, room.id
        );
        self.phase = Phase::Active(ActiveCtx {
            room_id: room.id,
            user,
            doc,
        });
        Flow::Continue
    }

    /// Find the room or create it on the fly; a soft-deleted room is the one
    /// case that refuses admission.
    async fn ensure_room(
        &self,
        store: &Arc<dyn RoomStore>,
        room_id: &str,
        user: &UserInfo,
    ) -> Result<crate::models::Room, Flow> {
        let found = store.find_room(room_id).await;
        match found {
            Ok(Some(room)) => Ok(room),
            Ok(None) => {
                match store
                    .create_room(room_id, room_id, &user.id, Visibility::Public)
                    .await
                {
                    Ok(room) => {
                        info!("created room {} on connect by {}", room.id, user.id);
                        Ok(room)
                    }
                    // Lost a creation race, or the id belongs to a deleted room.
                    Err(StoreError::AlreadyExists) => match store.find_room(room_id).await {
                        Ok(Some(room)) => Ok(room),
                        Ok(None) => {
                            self.send_error(ErrorCode::RoomNotFound, "room was deleted");
                            Err(Flow::Close(None))
                        }
                        Err(e) => Err(self.handshake_store_failure(e)),
                    },
                    Err(e) => Err(self.handshake_store_failure(e)),
                }
            }
            Err(e) => Err(self.handshake_store_failure(e)),
        }
    }

    fn handshake_store_failure(&self, e: StoreError) -> Flow {
        error!("handshake store failure for {}: {}", self.client_id, e);
        self.send_error(ErrorCode::Internal, "persistence failure");
        Flow::Close(None)
    }

    fn record_leave_in_background(&self) {
        let store = self.hub.store();
        let client_id = self.client_id;
        tokio::spawn(async move {
            let result = with_backoff("record_leave", || {
                let store = store.clone();
                async move { store.record_leave(client_id, Utc::now()).await }
            })
            .await;
            if let Err(e) = result {
                error!("failed to record leave for {}: {}", client_id, e);
            }
        });
    }

    fn not_connected(&self) -> Flow {
        self.send_error(ErrorCode::NotConnected, "connect first");
        Flow::Close(None)
    }

    /// Outcome of a mailbox submission: backlog means the sender is
    /// flooding the room, a gone owner means the document failed.
    fn submitted(&self, result: Result<(), ApplyError>) -> Flow {
        match result {
            Ok(()) => Flow::Continue,
            Err(ApplyError::Backlog) => {
                signal_kick(&self.kick, CloseReason::Flood);
                Flow::Close(Some(CloseReason::Flood))
            }
            Err(ApplyError::Gone) => {
                signal_kick(&self.kick, CloseReason::DocumentFailed);
                Flow::Close(Some(CloseReason::DocumentFailed))
            }
        }
    }

    fn send(&self, frame: &ServerFrame) -> bool {
        self.out_tx
            .try_send(Message::Text(codec::encode_frame(frame)))
            .is_ok()
    }

    fn send_error(&self, code: ErrorCode, message: impl Into<String>) {
        if !self.send(&ServerFrame::error(code, message.into())) {
            debug!("could not enqueue error frame for {}", self.client_id);
        }
    }
}
