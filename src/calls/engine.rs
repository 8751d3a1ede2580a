//! Engine front-end: intent API, session registry and inbound routing.
//!
//! Intents validate against a registry snapshot and enqueue into the owning
//! session task; the task re-validates against the live phase, so a stale
//! snapshot can never corrupt a session. The registry lock is a plain mutex
//! held only for map operations, never across an await.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use crate::config::EngineConfig;
use crate::error::CallError;
use crate::signaling::{SequenceGate, SignalingBody, SignalingMessage};
use crate::transport::{ConnectionState, SignalingLink, TransportFactory};
use crate::types::call::{SessionId, UserId};
use crate::types::events::EventBus;

use super::media::MediaController;
use super::peer::{PeerConnectionFactory, RemoteTrackSink};
use super::session::CallSession;
use super::task::{Intent, SessionEvent, SessionTask};

const LOG: &str = "Engine";

const SESSION_QUEUE_CAPACITY: usize = 64;

#[derive(Clone)]
struct SessionHandle {
    tx: mpsc::Sender<SessionEvent>,
    gate: Arc<SequenceGate>,
    ended: Arc<AtomicBool>,
}

impl SessionHandle {
    fn is_live(&self) -> bool {
        !self.ended.load(Ordering::SeqCst)
    }
}

pub(crate) struct EngineInner {
    pub(crate) local_user: UserId,
    pub(crate) config: EngineConfig,
    pub(crate) event_bus: EventBus,
    pub(crate) link: Arc<SignalingLink>,
    pub(crate) peer_factory: Arc<dyn PeerConnectionFactory>,
    pub(crate) media: Arc<dyn MediaController>,
    registry: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl EngineInner {
    /// Check-and-insert under one lock acquisition; this is what makes
    /// "at most one live call" hold.
    fn register_session(self: &Arc<Self>, session: CallSession) -> Result<(), CallError> {
        let session_id = session.session_id.clone();
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        let ended = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut registry = self.registry.lock().unwrap();
            if registry.values().any(SessionHandle::is_live) {
                return Err(CallError::CallInProgress);
            }
            registry.insert(
                session_id,
                SessionHandle {
                    tx: tx.clone(),
                    gate: Arc::new(SequenceGate::new()),
                    ended: Arc::clone(&ended),
                },
            );
        }
        let task = SessionTask::new(Arc::clone(self), session, rx, tx, ended, cancelled);
        tokio::spawn(task.run());
        Ok(())
    }

    pub(crate) fn remove_session(&self, session_id: &SessionId) {
        self.registry.lock().unwrap().remove(session_id);
    }

    fn handle(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.registry.lock().unwrap().get(session_id).cloned()
    }

    fn any_other_live(&self, session_id: &SessionId) -> bool {
        self.registry
            .lock()
            .unwrap()
            .iter()
            .any(|(id, handle)| id != session_id && handle.is_live())
    }

    async fn enqueue(&self, session_id: &SessionId, event: SessionEvent) -> Result<(), CallError> {
        let handle = self
            .handle(session_id)
            .filter(SessionHandle::is_live)
            .ok_or_else(|| CallError::InvalidCallState(format!("no live call {session_id}")))?;
        handle
            .tx
            .send(event)
            .await
            .map_err(|_| CallError::InvalidCallState(format!("call {session_id} already ended")))
    }

    async fn enqueue_intent(&self, session_id: &SessionId, intent: Intent) -> Result<(), CallError> {
        self.enqueue(session_id, SessionEvent::Intent(intent)).await
    }

    /// Busy reply for an invite that arrived while a call is live. Best
    /// effort; no session ever exists for the rejected id.
    fn send_busy(self: &Arc<Self>, invite: &SignalingMessage) {
        let reply = SignalingMessage::new(
            invite.session_id.clone(),
            self.local_user.clone(),
            invite.from.clone(),
            1,
            SignalingBody::Busy,
        );
        let link = Arc::clone(&self.link);
        let window = self.config.delivery_window;
        tokio::spawn(async move {
            if let Err(e) = link.send_within(&reply, window).await {
                warn!(target: LOG, "Busy reply for {} not delivered: {e}", reply.session_id);
            }
        });
    }

    async fn route_inbound(self: Arc<Self>, mut inbound: mpsc::Receiver<SignalingMessage>) {
        while let Some(msg) = inbound.recv().await {
            if msg.to != self.local_user {
                debug!(target: LOG, "Dropping {} addressed to {}", msg.body, msg.to);
                continue;
            }
            match self.handle(&msg.session_id) {
                Some(handle) => {
                    if !handle.is_live() {
                        debug!(target: LOG, "Dropping {} for ended session {}", msg.body, msg.session_id);
                        continue;
                    }
                    if !handle.gate.admit(&msg) {
                        debug!(target: LOG, "Dropping stale {} (seq {}) for {}", msg.body, msg.sequence, msg.session_id);
                        continue;
                    }
                    if handle.tx.send(SessionEvent::Inbound(msg)).await.is_err() {
                        debug!(target: LOG, "Session queue closed, message dropped");
                    }
                }
                None => match msg.body {
                    SignalingBody::Invite { video } => self.handle_invite(msg, video).await,
                    _ => {
                        debug!(target: LOG, "Dropping {} for unknown session {}", msg.body, msg.session_id);
                    }
                },
            }
        }
        debug!(target: LOG, "Inbound signaling stream closed");
    }

    async fn handle_invite(self: &Arc<Self>, msg: SignalingMessage, video: bool) {
        let session = CallSession::new_incoming(
            msg.session_id.clone(),
            self.local_user.clone(),
            msg.from.clone(),
            video,
        );
        match self.register_session(session) {
            Ok(()) => {
                info!(target: LOG, "Incoming call {} from {}", msg.session_id, msg.from);
                if let Some(handle) = self.handle(&msg.session_id) {
                    handle.gate.admit(&msg);
                    let _ = handle.tx.send(SessionEvent::Inbound(msg)).await;
                }
            }
            Err(CallError::CallInProgress) => {
                info!(target: LOG, "Rejecting invite {} from {}: call in progress", msg.session_id, msg.from);
                self.send_busy(&msg);
            }
            Err(e) => warn!(target: LOG, "Invite {} not registered: {e}", msg.session_id),
        }
    }
}

/// Call negotiation engine for one local user.
///
/// Owns the signaling link and all live sessions. Cheap to clone; all
/// clones share the same state.
#[derive(Clone)]
pub struct CallEngine {
    inner: Arc<EngineInner>,
}

impl CallEngine {
    pub fn new(
        local_user: UserId,
        config: EngineConfig,
        transport_factory: Box<dyn TransportFactory>,
        peer_factory: Arc<dyn PeerConnectionFactory>,
        media: Arc<dyn MediaController>,
    ) -> Self {
        let (link, inbound) = SignalingLink::spawn(transport_factory, config.reconnect_max_delay);
        let inner = Arc::new(EngineInner {
            local_user,
            config,
            event_bus: EventBus::new(),
            link,
            peer_factory,
            media,
            registry: Mutex::new(HashMap::new()),
        });
        tokio::spawn(Arc::clone(&inner).route_inbound(inbound));
        tokio::spawn(forward_connection_state(Arc::clone(&inner)));
        Self { inner }
    }

    /// Notification streams (call updates, incoming calls, connection state).
    pub fn events(&self) -> &EventBus {
        &self.inner.event_bus
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.link.state()
    }

    /// Start an outgoing call. Returns the new session id immediately;
    /// progress arrives on the notification stream.
    pub async fn place_call(&self, to: UserId, video: bool) -> Result<SessionId, CallError> {
        let session = CallSession::new_outgoing(self.inner.local_user.clone(), to, video);
        let session_id = session.session_id.clone();
        self.inner.register_session(session)?;
        info!(target: LOG, "Placed call {session_id}");
        Ok(session_id)
    }

    pub async fn accept_incoming(&self, session_id: &SessionId) -> Result<(), CallError> {
        if self.inner.any_other_live(session_id) {
            return Err(CallError::CallInProgress);
        }
        self.inner.enqueue_intent(session_id, Intent::Accept).await
    }

    pub async fn decline_incoming(&self, session_id: &SessionId) -> Result<(), CallError> {
        self.inner.enqueue_intent(session_id, Intent::Decline).await
    }

    pub async fn hangup(&self, session_id: &SessionId) -> Result<(), CallError> {
        self.inner.enqueue_intent(session_id, Intent::Hangup).await
    }

    pub async fn toggle_mute(&self, session_id: &SessionId) -> Result<(), CallError> {
        self.inner.enqueue_intent(session_id, Intent::ToggleMute).await
    }

    pub async fn toggle_video(&self, session_id: &SessionId) -> Result<(), CallError> {
        self.inner.enqueue_intent(session_id, Intent::ToggleVideo).await
    }

    pub async fn switch_camera(&self, session_id: &SessionId) -> Result<(), CallError> {
        self.inner.enqueue_intent(session_id, Intent::SwitchCamera).await
    }

    pub async fn toggle_speaker(&self, session_id: &SessionId) -> Result<(), CallError> {
        self.inner.enqueue_intent(session_id, Intent::ToggleSpeaker).await
    }

    /// Attach a sink for the session's remote media frames. May be called
    /// before the media path exists; the binding is applied once it does.
    pub async fn bind_remote_track_sink(
        &self,
        session_id: &SessionId,
        sink: Arc<dyn RemoteTrackSink>,
    ) -> Result<(), CallError> {
        self.inner
            .enqueue(session_id, SessionEvent::BindRemoteSink(sink))
            .await
    }

    /// Tear down the signaling link. Live sessions observe the disconnect
    /// and fail on their own timers.
    pub async fn shutdown(&self) {
        self.inner.link.shutdown().await;
    }
}

async fn forward_connection_state(inner: Arc<EngineInner>) {
    let mut state = inner.link.state();
    loop {
        let current = *state.borrow_and_update();
        inner.event_bus.publish_connection(current);
        if state.changed().await.is_err() {
            break;
        }
    }
}
