//! Per-session event loop.
//!
//! Each session is owned by exactly one task: every local intent, inbound
//! signaling message, timer expiry and peer-transport event for the session
//! is funneled through one ordered queue into this loop, so nothing else
//! ever mutates the `CallSession`. Blocking work (media acquisition, SDP
//! creation) runs in spawned subtasks that post their results back into the
//! queue and check the session's cancellation flag before doing so, so a
//! late result for a dead session is discarded instead of corrupting state.

use log::{debug, info, warn};
use std::future::pending;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

use crate::error::CallError;
use crate::signaling::{SignalingBody, SignalingMessage};
use crate::types::call::{CallRole, EndReason};

use super::engine::EngineInner;
use super::ice::CandidateDisposition;
use super::peer::{PeerConnection, PeerEvent, RemoteTrackSink};
use super::session::{CallPhase, CallSession, CallTransition};

const LOG: &str = "Engine/Session";

/// Local user intents routed through the session queue.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Intent {
    Accept,
    Decline,
    Hangup,
    ToggleMute,
    ToggleVideo,
    SwitchCamera,
    ToggleSpeaker,
}

/// SDP produced by a spawned negotiation subtask.
#[derive(Debug)]
pub(crate) enum SdpReady {
    Offer(String),
    Answer(String),
}

pub(crate) enum SessionEvent {
    Intent(Intent),
    Inbound(SignalingMessage),
    MediaReady(Result<(), CallError>),
    LocalSdpReady(Result<SdpReady, CallError>),
    Peer(PeerEvent),
    /// Rendering layer wants remote media frames for this session.
    BindRemoteSink(Arc<dyn RemoteTrackSink>),
    /// A fire-and-forget signaling send missed the delivery window.
    SendFailed(CallError),
}

/// One queued outbound message. Terminal sends (`hangup`/`decline`) carry
/// an ack channel so the session learns the delivery outcome before it
/// transitions.
struct OutboundFrame {
    msg: SignalingMessage,
    ack: Option<oneshot::Sender<Result<(), CallError>>>,
}

pub(crate) struct SessionTask {
    inner: Arc<EngineInner>,
    session: CallSession,
    rx: mpsc::Receiver<SessionEvent>,
    self_tx: mpsc::Sender<SessionEvent>,
    /// Checked by in-flight subtasks before applying their results.
    cancelled: Arc<AtomicBool>,
    /// Shared with the registry handle so routing can skip ended sessions.
    ended: Arc<AtomicBool>,
    /// Shared with the scopeguard so media is released on every exit path.
    media_held: Arc<AtomicBool>,
    /// Single outbound lane: gated messages must hit the wire in sequence
    /// order, so one task sends them FIFO, retrying in place.
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    outbound_rx: Option<mpsc::UnboundedReceiver<OutboundFrame>>,
    peer: Option<Arc<dyn PeerConnection>>,
    /// Sink bound before the peer transport exists, attached on creation.
    pending_sink: Option<Arc<dyn RemoteTrackSink>>,
    answer_started: bool,
    ring_deadline: Option<Instant>,
    connect_deadline: Option<Instant>,
    ice_grace_deadline: Option<Instant>,
    linger_deadline: Option<Instant>,
    done: bool,
}

impl SessionTask {
    pub(crate) fn new(
        inner: Arc<EngineInner>,
        session: CallSession,
        rx: mpsc::Receiver<SessionEvent>,
        self_tx: mpsc::Sender<SessionEvent>,
        ended: Arc<AtomicBool>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inner,
            session,
            rx,
            self_tx,
            cancelled,
            ended,
            media_held: Arc::new(AtomicBool::new(false)),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            peer: None,
            pending_sink: None,
            answer_started: false,
            ring_deadline: None,
            connect_deadline: None,
            ice_grace_deadline: None,
            linger_deadline: None,
            done: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let session_id = self.session.session_id.clone();
        info!(
            target: LOG,
            "Session {} started ({:?} with {})",
            session_id, self.session.role, self.session.remote_user
        );

        // Media and the registry entry are reclaimed on every exit path,
        // including a panic inside the loop.
        let guard_inner = Arc::clone(&self.inner);
        let guard_media_held = Arc::clone(&self.media_held);
        let guard_id = session_id.clone();
        let _cleanup = scopeguard::guard((), move |_| {
            if guard_media_held.swap(false, Ordering::SeqCst) {
                guard_inner.media.release();
            }
            guard_inner.remove_session(&guard_id);
        });

        self.spawn_outbound_sender();
        self.ring_deadline = Some(Instant::now() + self.inner.config.ring_timeout);
        self.publish();
        if self.session.role == CallRole::Caller {
            self.spawn_media_acquire();
        }

        while !self.done {
            let next_deadline = [
                self.ring_deadline,
                self.connect_deadline,
                self.ice_grace_deadline,
                self.linger_deadline,
            ]
            .into_iter()
            .flatten()
            .min();

            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = wait_for(next_deadline) => self.handle_deadline().await,
            }
        }

        info!(target: LOG, "Session {} finished", session_id);
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Intent(intent) => self.handle_intent(intent).await,
            SessionEvent::Inbound(msg) => self.handle_inbound(msg).await,
            SessionEvent::MediaReady(result) => self.handle_media_ready(result).await,
            SessionEvent::LocalSdpReady(result) => self.handle_sdp_ready(result).await,
            SessionEvent::Peer(event) => self.handle_peer_event(event).await,
            SessionEvent::BindRemoteSink(sink) => match &self.peer {
                Some(peer) => peer.bind_remote_track_sink(sink),
                None => self.pending_sink = Some(sink),
            },
            SessionEvent::SendFailed(err) => {
                if !self.session.phase.is_ended() {
                    warn!(target: LOG, "Session {}: signaling delivery failed: {err}", self.session.session_id);
                    self.finish(EndReason::Failed(err.to_string()), None).await;
                }
            }
        }
    }

    // ---- local intents -----------------------------------------------------

    async fn handle_intent(&mut self, intent: Intent) {
        if self.session.phase.is_ended() {
            debug!(target: LOG, "Session {}: intent {intent:?} after end, ignoring", self.session.session_id);
            return;
        }
        match intent {
            Intent::Accept => self.handle_accept_intent().await,
            Intent::Decline => {
                if self.session.phase.can_decline() {
                    self.finish(EndReason::Declined, Some(SignalingBody::Decline))
                        .await;
                } else {
                    warn!(target: LOG, "Session {}: decline in phase {}, ignoring", self.session.session_id, self.session.phase.name());
                }
            }
            Intent::Hangup => {
                self.finish(EndReason::LocalHangup, Some(SignalingBody::Hangup))
                    .await;
            }
            Intent::ToggleMute => {
                let muted = !self.session.media.muted;
                self.session.media.muted = muted;
                if let Err(e) = self.inner.media.set_muted(muted).await {
                    warn!(target: LOG, "Session {}: mute toggle failed: {e}", self.session.session_id);
                }
                if let Some(peer) = self.peer.clone()
                    && let Err(e) = peer.set_muted(muted).await
                {
                    self.finish(EndReason::Failed(e.to_string()), None).await;
                    return;
                }
                self.publish();
            }
            Intent::ToggleVideo => {
                let enabled = !self.session.media.video_enabled;
                self.session.media.video_enabled = enabled;
                if let Err(e) = self.inner.media.set_video_enabled(enabled).await {
                    warn!(target: LOG, "Session {}: video toggle failed: {e}", self.session.session_id);
                }
                self.publish();
            }
            Intent::SwitchCamera => {
                if let Err(e) = self.inner.media.switch_camera().await {
                    warn!(target: LOG, "Session {}: camera switch failed: {e}", self.session.session_id);
                }
                if let Some(peer) = self.peer.clone()
                    && let Err(e) = peer.switch_camera().await
                {
                    self.finish(EndReason::Failed(e.to_string()), None).await;
                    return;
                }
                self.publish();
            }
            Intent::ToggleSpeaker => {
                let on = !self.session.media.speaker_on;
                self.session.media.speaker_on = on;
                if let Err(e) = self.inner.media.set_speaker(on).await {
                    warn!(target: LOG, "Session {}: speaker toggle failed: {e}", self.session.session_id);
                }
                if let Some(peer) = self.peer.clone()
                    && let Err(e) = peer.set_speaker(on).await
                {
                    self.finish(EndReason::Failed(e.to_string()), None).await;
                    return;
                }
                self.publish();
            }
        }
    }

    async fn handle_accept_intent(&mut self) {
        if !self.session.phase.can_accept() {
            warn!(
                target: LOG,
                "Session {}: accept in phase {}, ignoring",
                self.session.session_id, self.session.phase.name()
            );
            return;
        }
        if self.session.apply(CallTransition::LocalAccepted).is_ok() {
            self.ring_deadline = None;
            self.connect_deadline = Some(Instant::now() + self.inner.config.connect_timeout);
            self.publish();
            self.spawn_media_acquire();
        }
    }

    // ---- inbound signaling -------------------------------------------------

    async fn handle_inbound(&mut self, msg: SignalingMessage) {
        if self.session.phase.is_ended() {
            // Stray signaling within the linger window is absorbed silently.
            debug!(target: LOG, "Session {}: dropping {} after end", self.session.session_id, msg.body);
            return;
        }
        match msg.body {
            SignalingBody::Invite { video } => {
                // The invite that created this session, routed through for
                // the notification side effect.
                self.inner
                    .event_bus
                    .publish_incoming_call(crate::types::events::IncomingCall {
                        session_id: self.session.session_id.clone(),
                        from: self.session.remote_user.clone(),
                        video,
                    });
            }
            SignalingBody::Accept => {
                if matches!(self.session.phase, CallPhase::Outgoing { .. })
                    && self.session.apply(CallTransition::RemoteAccepted).is_ok()
                {
                    self.ring_deadline = None;
                    self.connect_deadline =
                        Some(Instant::now() + self.inner.config.connect_timeout);
                    self.publish();
                } else {
                    warn!(target: LOG, "Session {}: accept in phase {}, ignoring", self.session.session_id, self.session.phase.name());
                }
            }
            SignalingBody::Decline | SignalingBody::Busy => {
                if self.session.phase.is_ringing()
                    || matches!(self.session.phase, CallPhase::Connecting { .. })
                {
                    self.finish(EndReason::Declined, None).await;
                } else {
                    warn!(target: LOG, "Session {}: {} in phase {}, ignoring", self.session.session_id, msg.body, self.session.phase.name());
                }
            }
            SignalingBody::Offer { sdp } => self.handle_remote_offer(sdp).await,
            SignalingBody::Answer { sdp } => self.handle_remote_answer(sdp).await,
            SignalingBody::IceCandidate { candidate } => {
                match self.session.candidates.add_remote(candidate) {
                    CandidateDisposition::Forward(candidate) => {
                        if let Some(peer) = self.peer.clone()
                            && let Err(e) = peer.add_ice_candidate(&candidate).await
                        {
                            self.finish(EndReason::Failed(e.to_string()), None).await;
                        }
                    }
                    CandidateDisposition::Buffered | CandidateDisposition::Duplicate => {}
                }
            }
            SignalingBody::Hangup => {
                self.finish(EndReason::RemoteHangup, None).await;
            }
        }
    }

    async fn handle_remote_offer(&mut self, sdp: String) {
        if self.session.role != CallRole::Callee {
            warn!(target: LOG, "Session {}: offer received by caller, ignoring", self.session.session_id);
            return;
        }
        self.session.pending_remote_offer = Some(sdp);
        self.try_begin_answer();
    }

    async fn handle_remote_answer(&mut self, sdp: String) {
        if self.session.role != CallRole::Caller {
            warn!(target: LOG, "Session {}: answer received by callee, ignoring", self.session.session_id);
            return;
        }
        // An answer implies the peer accepted, even if the accept frame was
        // lost; the sequence gate already dropped stale duplicates.
        if matches!(self.session.phase, CallPhase::Outgoing { .. })
            && self.session.apply(CallTransition::RemoteAccepted).is_ok()
        {
            self.ring_deadline = None;
            self.connect_deadline = Some(Instant::now() + self.inner.config.connect_timeout);
            self.publish();
        }
        if !matches!(self.session.phase, CallPhase::Connecting { .. }) {
            warn!(target: LOG, "Session {}: answer in phase {}, ignoring", self.session.session_id, self.session.phase.name());
            return;
        }
        let Some(peer) = self.peer.clone() else {
            warn!(target: LOG, "Session {}: answer before peer transport exists, ignoring", self.session.session_id);
            return;
        };
        if let Err(e) = peer.apply_remote_description(&sdp).await {
            self.finish(EndReason::Failed(e.to_string()), None).await;
            return;
        }
        self.drain_remote_candidates(&peer).await;
    }

    // ---- async results -----------------------------------------------------

    async fn handle_media_ready(&mut self, result: Result<(), CallError>) {
        match result {
            Ok(()) => {
                if self.session.phase.is_ended() {
                    // Acquisition finished after the session died.
                    self.inner.media.release();
                    return;
                }
                self.media_held.store(true, Ordering::SeqCst);
                self.start_peer().await;
            }
            Err(e) => {
                warn!(target: LOG, "Session {}: media acquisition failed: {e}", self.session.session_id);
                if !self.session.phase.is_ended() {
                    self.finish(EndReason::Failed(e.to_string()), None).await;
                }
            }
        }
    }

    async fn start_peer(&mut self) {
        let (peer, events) = match self.inner.peer_factory.create(&self.session.session_id).await {
            Ok(created) => created,
            Err(e) => {
                self.finish(EndReason::Failed(e.to_string()), None).await;
                return;
            }
        };
        self.spawn_peer_pump(events);
        if let Some(sink) = self.pending_sink.take() {
            peer.bind_remote_track_sink(sink);
        }
        if let Err(e) = peer.attach_local_track().await {
            self.finish(EndReason::Failed(e.to_string()), None).await;
            return;
        }
        self.peer = Some(Arc::clone(&peer));

        match self.session.role {
            CallRole::Caller => {
                let tx = self.self_tx.clone();
                let cancelled = Arc::clone(&self.cancelled);
                tokio::spawn(async move {
                    let result = peer.create_offer().await.map(SdpReady::Offer);
                    if !cancelled.load(Ordering::Relaxed) {
                        let _ = tx.send(SessionEvent::LocalSdpReady(result)).await;
                    }
                });
            }
            CallRole::Callee => self.try_begin_answer(),
        }
    }

    /// Callee side: answer once the offer has arrived, the user has
    /// accepted and the peer transport exists.
    fn try_begin_answer(&mut self) {
        if self.answer_started
            || !matches!(self.session.phase, CallPhase::Connecting { .. })
            || self.peer.is_none()
        {
            return;
        }
        let Some(offer) = self.session.pending_remote_offer.clone() else {
            return;
        };
        self.answer_started = true;
        let peer = self.peer.clone().expect("peer checked above");
        let tx = self.self_tx.clone();
        let cancelled = Arc::clone(&self.cancelled);
        tokio::spawn(async move {
            let result = peer.create_answer(&offer).await.map(SdpReady::Answer);
            if !cancelled.load(Ordering::Relaxed) {
                let _ = tx.send(SessionEvent::LocalSdpReady(result)).await;
            }
        });
    }

    async fn handle_sdp_ready(&mut self, result: Result<SdpReady, CallError>) {
        if self.session.phase.is_ended() {
            return;
        }
        let sdp = match result {
            Ok(sdp) => sdp,
            Err(e) => {
                self.finish(EndReason::Failed(e.to_string()), None).await;
                return;
            }
        };
        match sdp {
            SdpReady::Offer(sdp) => {
                let video = self.session.media.video_enabled;
                self.send_signal(SignalingBody::Invite { video });
                self.send_signal(SignalingBody::Offer { sdp });
                self.flush_local_candidates();
            }
            SdpReady::Answer(sdp) => {
                // `create_answer` applied the remote description as part of
                // producing the answer.
                if let Some(peer) = self.peer.clone() {
                    self.drain_remote_candidates(&peer).await;
                }
                self.send_signal(SignalingBody::Accept);
                self.send_signal(SignalingBody::Answer { sdp });
                self.flush_local_candidates();
            }
        }
    }

    // ---- peer transport events --------------------------------------------

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        if self.session.phase.is_ended() {
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                match self.session.candidates.add_local(candidate) {
                    CandidateDisposition::Forward(candidate) => {
                        self.send_signal(SignalingBody::IceCandidate { candidate });
                    }
                    CandidateDisposition::Buffered | CandidateDisposition::Duplicate => {}
                }
            }
            PeerEvent::IceConnected => {
                self.ice_grace_deadline = None;
                if matches!(self.session.phase, CallPhase::Connecting { .. })
                    && self.session.apply(CallTransition::MediaConnected).is_ok()
                {
                    self.connect_deadline = None;
                    self.publish();
                }
            }
            PeerEvent::IceDisconnected => {
                if self.session.phase.is_active() && self.ice_grace_deadline.is_none() {
                    debug!(target: LOG, "Session {}: ICE disconnected, starting grace window", self.session.session_id);
                    self.ice_grace_deadline =
                        Some(Instant::now() + self.inner.config.ice_disconnect_grace);
                }
            }
            PeerEvent::IceFailed => {
                self.finish(EndReason::Failed("ice negotiation failed".into()), None)
                    .await;
            }
            PeerEvent::RemoteTrack => {
                self.session.remote_track_bound = true;
                if matches!(self.session.phase, CallPhase::Connecting { .. })
                    && self.session.apply(CallTransition::MediaConnected).is_ok()
                {
                    self.connect_deadline = None;
                }
                self.publish();
            }
        }
    }

    // ---- timers ------------------------------------------------------------

    async fn handle_deadline(&mut self) {
        let now = Instant::now();

        if expired(self.linger_deadline, now) {
            self.done = true;
            return;
        }
        if expired(self.ring_deadline, now) {
            self.ring_deadline = None;
            let terminal = if self.session.phase.can_decline() {
                // Let the caller's side stop ringing.
                Some(SignalingBody::Decline)
            } else {
                None
            };
            self.finish(EndReason::Timeout, terminal).await;
            return;
        }
        if expired(self.connect_deadline, now) {
            self.connect_deadline = None;
            self.finish(EndReason::Failed("negotiation timed out".into()), None)
                .await;
            return;
        }
        if expired(self.ice_grace_deadline, now) {
            self.ice_grace_deadline = None;
            self.finish(
                EndReason::Failed("ice disconnected beyond grace window".into()),
                None,
            )
            .await;
        }
    }

    // ---- helpers -----------------------------------------------------------

    /// Terminal transition. Attempts delivery of `terminal` (hangup/decline)
    /// within the bounded window first; if that fails the recorded reason
    /// becomes `Failed`, still written exactly once.
    async fn finish(&mut self, reason: EndReason, terminal: Option<SignalingBody>) {
        if self.session.phase.is_ended() {
            return;
        }
        let mut reason = reason;
        if let Some(body) = terminal {
            let msg = self.make_message(body);
            let kind = msg.body.kind();
            let (ack_tx, ack_rx) = oneshot::channel();
            let delivered = if self
                .outbound_tx
                .send(OutboundFrame {
                    msg,
                    ack: Some(ack_tx),
                })
                .is_ok()
            {
                ack_rx.await.unwrap_or_else(|_| {
                    Err(CallError::TransportUnavailable(
                        "outbound sender stopped".into(),
                    ))
                })
            } else {
                Err(CallError::TransportUnavailable(
                    "outbound sender stopped".into(),
                ))
            };
            if let Err(e) = delivered {
                warn!(target: LOG, "Session {}: could not deliver {kind}: {e}", self.session.session_id);
                reason = EndReason::Failed(e.to_string());
            }
        }

        info!(target: LOG, "Session {} ending: {reason}", self.session.session_id);
        if self.session.apply(CallTransition::Terminated { reason }).is_err() {
            return;
        }
        self.ended.store(true, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        self.ring_deadline = None;
        self.connect_deadline = None;
        self.ice_grace_deadline = None;
        self.linger_deadline = Some(Instant::now() + self.inner.config.ended_linger);

        if self.media_held.swap(false, Ordering::SeqCst) {
            self.inner.media.release();
        }
        if let Some(peer) = self.peer.take() {
            let _ = peer.detach_local_track().await;
            peer.close().await;
        }
        self.publish();
    }

    fn make_message(&mut self, body: SignalingBody) -> SignalingMessage {
        let sequence = self.session.next_sequence();
        SignalingMessage::new(
            self.session.session_id.clone(),
            self.session.local_user.clone(),
            self.session.remote_user.clone(),
            sequence,
            body,
        )
    }

    /// Fire-and-forget signaling send, queued behind everything already
    /// outbound; a missed delivery window comes back as `SendFailed`.
    fn send_signal(&mut self, body: SignalingBody) {
        let msg = self.make_message(body);
        let _ = self.outbound_tx.send(OutboundFrame { msg, ack: None });
    }

    /// Drains the outbound queue one message at a time. A transiently
    /// failing send retries here, in place, so a later message can never
    /// overtake an earlier one and hand the peer an offer for a session it
    /// has not been invited to yet.
    fn spawn_outbound_sender(&mut self) {
        let Some(mut outbound) = self.outbound_rx.take() else {
            return;
        };
        let link = Arc::clone(&self.inner.link);
        let window = self.inner.config.delivery_window;
        let tx = self.self_tx.clone();
        let cancelled = Arc::clone(&self.cancelled);
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let result = link.send_within(&frame.msg, window).await;
                match frame.ack {
                    Some(ack) => {
                        let _ = ack.send(result);
                    }
                    None => {
                        if let Err(e) = result
                            && !cancelled.load(Ordering::Relaxed)
                        {
                            let _ = tx.send(SessionEvent::SendFailed(e)).await;
                        }
                    }
                }
            }
        });
    }

    /// The local description now exists: transmit everything gathered so far.
    fn flush_local_candidates(&mut self) {
        for candidate in self.session.candidates.mark_local_ready() {
            self.send_signal(SignalingBody::IceCandidate { candidate });
        }
    }

    /// The remote description is applied: feed buffered remote candidates to
    /// the peer transport in arrival order.
    async fn drain_remote_candidates(&mut self, peer: &Arc<dyn PeerConnection>) {
        for candidate in self.session.candidates.mark_remote_ready() {
            if let Err(e) = peer.add_ice_candidate(&candidate).await {
                self.finish(EndReason::Failed(e.to_string()), None).await;
                return;
            }
        }
    }

    fn spawn_media_acquire(&self) {
        let media = Arc::clone(&self.inner.media);
        let tx = self.self_tx.clone();
        let cancelled = Arc::clone(&self.cancelled);
        let video = self.session.media.video_enabled;
        tokio::spawn(async move {
            let result = media.acquire(video).await;
            if cancelled.load(Ordering::Relaxed) {
                // Late success for a dead session: hand the device back.
                if result.is_ok() {
                    media.release();
                }
                return;
            }
            let _ = tx.send(SessionEvent::MediaReady(result)).await;
        });
    }

    fn spawn_peer_pump(&self, mut events: mpsc::Receiver<PeerEvent>) {
        let tx = self.self_tx.clone();
        let cancelled = Arc::clone(&self.cancelled);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if cancelled.load(Ordering::Relaxed) {
                    break;
                }
                if tx.send(SessionEvent::Peer(event)).await.is_err() {
                    break;
                }
            }
        });
    }

    fn publish(&self) {
        self.inner.event_bus.publish_call_update(self.session.snapshot());
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

fn expired(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|d| d <= now)
}
