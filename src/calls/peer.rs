//! Seam toward the underlying peer media transport.
//!
//! The engine never talks to a WebRTC stack directly; it drives this trait
//! and reacts to the [`PeerEvent`] stream. Phase validity of each operation
//! is enforced by the session task that calls it, not by implementations.

use crate::error::CallError;
use crate::types::call::{IceCandidate, SessionId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events surfaced by the peer transport.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A locally gathered network candidate to be signaled to the peer.
    LocalCandidate(IceCandidate),
    /// The media path is established.
    IceConnected,
    /// The media path dropped; may recover within the grace window.
    IceDisconnected,
    /// Negotiation failed irrecoverably.
    IceFailed,
    /// A remote media track was attached to the session.
    RemoteTrack,
}

/// Sink for decoded remote media, provided by the rendering layer.
pub trait RemoteTrackSink: Send + Sync {
    fn on_frame(&self, frame: &[u8]);
}

/// One peer transport, created per session.
///
/// All operations except [`close`](PeerConnection::close) report
/// `NegotiationError` on failure; `close` is idempotent and always safe,
/// including on an already-closed connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, CallError>;
    async fn create_answer(&self, remote_sdp: &str) -> Result<String, CallError>;
    async fn apply_remote_description(&self, sdp: &str) -> Result<(), CallError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError>;
    async fn attach_local_track(&self) -> Result<(), CallError>;
    async fn detach_local_track(&self) -> Result<(), CallError>;
    fn bind_remote_track_sink(&self, sink: Arc<dyn RemoteTrackSink>);
    async fn switch_camera(&self) -> Result<(), CallError>;
    async fn set_muted(&self, muted: bool) -> Result<(), CallError>;
    async fn set_speaker(&self, on: bool) -> Result<(), CallError>;
    async fn close(&self);
}

/// Creates peer transports and their event streams.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        session_id: &SessionId,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), CallError>;
}

pub mod sim {
    //! Simulated peer transport.
    //!
    //! Completes the offer/answer dance with canned SDP and reports a
    //! connected media path as soon as both descriptions are in place.
    //! Stands in wherever no real media stack is wired up: the loopback
    //! demo and the scenario tests.

    use super::*;
    use std::sync::Mutex;

    const EVENT_CHANNEL_CAPACITY: usize = 64;

    #[derive(Default)]
    struct SimState {
        local_description: bool,
        remote_description: bool,
        connected_emitted: bool,
        closed: bool,
        applied_candidates: Vec<IceCandidate>,
    }

    pub struct SimPeerConnection {
        session_id: SessionId,
        state: Mutex<SimState>,
        events: mpsc::Sender<PeerEvent>,
        sink: Mutex<Option<Arc<dyn RemoteTrackSink>>>,
    }

    impl SimPeerConnection {
        fn sdp(&self, kind: &str) -> String {
            format!("v=0\r\no=peercall-sim {kind} {}\r\n", self.session_id)
        }

        fn guard_open(&self, state: &SimState) -> Result<(), CallError> {
            if state.closed {
                Err(CallError::NegotiationError(
                    "peer connection is closed".into(),
                ))
            } else {
                Ok(())
            }
        }

        fn emit(&self, event: PeerEvent) {
            let _ = self.events.try_send(event);
        }

        fn maybe_connected(&self, state: &mut SimState) {
            if state.local_description && state.remote_description && !state.connected_emitted {
                state.connected_emitted = true;
                self.emit(PeerEvent::IceConnected);
                self.emit(PeerEvent::RemoteTrack);
            }
        }

        /// Candidates applied so far, in application order.
        pub fn applied_candidates(&self) -> Vec<IceCandidate> {
            self.state.lock().unwrap().applied_candidates.clone()
        }

        /// Surface a transport event, as a real stack would on network
        /// changes.
        pub fn inject(&self, event: PeerEvent) {
            self.emit(event);
        }
    }

    #[async_trait]
    impl PeerConnection for SimPeerConnection {
        async fn create_offer(&self) -> Result<String, CallError> {
            let mut state = self.state.lock().unwrap();
            self.guard_open(&state)?;
            state.local_description = true;
            self.emit(PeerEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:1 1 UDP 2130706431 198.51.100.1 40000 typ host generation 0 session {}",
                self.session_id
            ))));
            Ok(self.sdp("offer"))
        }

        async fn create_answer(&self, remote_sdp: &str) -> Result<String, CallError> {
            let mut state = self.state.lock().unwrap();
            self.guard_open(&state)?;
            if remote_sdp.is_empty() {
                return Err(CallError::NegotiationError("empty remote offer".into()));
            }
            state.remote_description = true;
            state.local_description = true;
            self.emit(PeerEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:2 1 UDP 2130706431 198.51.100.2 40002 typ host generation 0 session {}",
                self.session_id
            ))));
            self.maybe_connected(&mut state);
            Ok(self.sdp("answer"))
        }

        async fn apply_remote_description(&self, sdp: &str) -> Result<(), CallError> {
            let mut state = self.state.lock().unwrap();
            self.guard_open(&state)?;
            if sdp.is_empty() {
                return Err(CallError::NegotiationError(
                    "empty remote description".into(),
                ));
            }
            state.remote_description = true;
            self.maybe_connected(&mut state);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
            let mut state = self.state.lock().unwrap();
            self.guard_open(&state)?;
            state.applied_candidates.push(candidate.clone());
            Ok(())
        }

        async fn attach_local_track(&self) -> Result<(), CallError> {
            self.guard_open(&self.state.lock().unwrap())
        }

        async fn detach_local_track(&self) -> Result<(), CallError> {
            self.guard_open(&self.state.lock().unwrap())
        }

        fn bind_remote_track_sink(&self, sink: Arc<dyn RemoteTrackSink>) {
            *self.sink.lock().unwrap() = Some(sink);
        }

        async fn switch_camera(&self) -> Result<(), CallError> {
            self.guard_open(&self.state.lock().unwrap())
        }

        async fn set_muted(&self, _muted: bool) -> Result<(), CallError> {
            self.guard_open(&self.state.lock().unwrap())
        }

        async fn set_speaker(&self, _on: bool) -> Result<(), CallError> {
            self.guard_open(&self.state.lock().unwrap())
        }

        async fn close(&self) {
            self.state.lock().unwrap().closed = true;
        }
    }

    #[derive(Default)]
    pub struct SimPeerFactory {
        created: Mutex<Vec<Arc<SimPeerConnection>>>,
    }

    impl SimPeerFactory {
        /// Connections handed out so far, in creation order.
        pub fn created(&self) -> Vec<Arc<SimPeerConnection>> {
            self.created.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerConnectionFactory for SimPeerFactory {
        async fn create(
            &self,
            session_id: &SessionId,
        ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), CallError> {
            let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let conn = Arc::new(SimPeerConnection {
                session_id: session_id.clone(),
                state: Mutex::new(SimState::default()),
                events,
                sink: Mutex::new(None),
            });
            self.created.lock().unwrap().push(Arc::clone(&conn));
            Ok((conn, events_rx))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_offer_answer_reaches_connected() {
            let factory = SimPeerFactory::default();
            let (caller, mut caller_events) =
                factory.create(&SessionId::new("S1")).await.unwrap();
            let (callee, mut callee_events) =
                factory.create(&SessionId::new("S1")).await.unwrap();

            let offer = caller.create_offer().await.unwrap();
            let answer = callee.create_answer(&offer).await.unwrap();
            caller.apply_remote_description(&answer).await.unwrap();

            // Caller: candidate then connected.
            assert!(matches!(
                caller_events.recv().await,
                Some(PeerEvent::LocalCandidate(_))
            ));
            assert!(matches!(
                caller_events.recv().await,
                Some(PeerEvent::IceConnected)
            ));
            // Callee connects when the answer is created.
            assert!(matches!(
                callee_events.recv().await,
                Some(PeerEvent::LocalCandidate(_))
            ));
            assert!(matches!(
                callee_events.recv().await,
                Some(PeerEvent::IceConnected)
            ));
        }

        #[tokio::test]
        async fn test_close_is_idempotent() {
            let factory = SimPeerFactory::default();
            let (conn, _events) = factory.create(&SessionId::new("S2")).await.unwrap();
            conn.close().await;
            conn.close().await;
            assert!(conn.create_offer().await.is_err());
        }
    }
}
