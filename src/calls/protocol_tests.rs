//! End-to-end scenarios: two engines talking through the in-process relay
//! with simulated peer transports and counting media backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};

use super::CallEngine;
use crate::calls::media::SimMedia;
use crate::calls::peer::sim::SimPeerFactory;
use crate::calls::peer::{PeerEvent, RemoteTrackSink};
use crate::config::EngineConfig;
use crate::error::CallError;
use crate::signaling::{SignalingBody, SignalingMessage};
use crate::transport::mem::{MemoryRelay, MemoryTransportFactory};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::call::{EndReason, IceCandidate, SessionId, UserId};
use crate::types::events::{CallUpdate, IncomingCall};

fn engine_with_config(
    relay: &Arc<MemoryRelay>,
    name: &str,
    config: EngineConfig,
) -> (CallEngine, Arc<SimMedia>) {
    let media = SimMedia::new();
    let engine = CallEngine::new(
        UserId::from(name),
        config,
        Box::new(relay.factory(UserId::from(name))),
        Arc::new(SimPeerFactory::default()),
        media.clone(),
    );
    (engine, media)
}

fn engine_for(relay: &Arc<MemoryRelay>, name: &str) -> (CallEngine, Arc<SimMedia>) {
    engine_with_config(relay, name, EngineConfig::default())
}

/// Waits for the first call update matching the predicate. Generous
/// timeout; under a paused clock it only fires if the update never comes.
async fn wait_update(
    rx: &mut broadcast::Receiver<Arc<CallUpdate>>,
    pred: impl Fn(&CallUpdate) -> bool,
) -> Arc<CallUpdate> {
    timeout(Duration::from_secs(60), async {
        loop {
            match rx.recv().await {
                Ok(update) if pred(&update) => return update,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("update stream closed"),
            }
        }
    })
    .await
    .expect("no matching call update")
}

async fn wait_incoming(rx: &mut broadcast::Receiver<Arc<IncomingCall>>) -> Arc<IncomingCall> {
    timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("no incoming call")
        .expect("incoming stream closed")
}

/// Places a call, has the callee accept it and waits for both sides to go
/// active.
async fn establish_call(caller: &CallEngine, callee: &CallEngine, callee_name: &str) -> SessionId {
    let mut caller_updates = caller.events().call_update.subscribe();
    let mut callee_updates = callee.events().call_update.subscribe();
    let mut callee_incoming = callee.events().incoming_call.subscribe();

    let session_id = caller
        .place_call(UserId::from(callee_name), false)
        .await
        .expect("place call");
    let incoming = wait_incoming(&mut callee_incoming).await;
    assert_eq!(incoming.session_id, session_id);

    callee.accept_incoming(&session_id).await.expect("accept");
    wait_update(&mut caller_updates, |u| u.phase.is_active()).await;
    wait_update(&mut callee_updates, |u| u.phase.is_active()).await;
    session_id
}

#[tokio::test]
async fn test_accept_reaches_active_then_remote_hangup() {
    let relay = MemoryRelay::new();
    let (alice, alice_media) = engine_for(&relay, "alice");
    let (bob, bob_media) = engine_for(&relay, "bob");

    let mut alice_updates = alice.events().call_update.subscribe();
    let mut bob_updates = bob.events().call_update.subscribe();
    let mut bob_incoming = bob.events().incoming_call.subscribe();

    let session_id = alice
        .place_call(UserId::from("bob"), true)
        .await
        .expect("place call");

    let ringing = wait_incoming(&mut bob_incoming).await;
    assert_eq!(ringing.session_id, session_id);
    assert_eq!(ringing.from, UserId::from("alice"));
    assert!(ringing.video);

    // A second outgoing call while this one rings is rejected outright.
    assert!(matches!(
        alice.place_call(UserId::from("carol"), false).await,
        Err(CallError::CallInProgress)
    ));

    // Binding a sink before the media path exists is fine; it attaches
    // once the peer transport comes up.
    struct NullSink;
    impl RemoteTrackSink for NullSink {
        fn on_frame(&self, _frame: &[u8]) {}
    }
    bob.bind_remote_track_sink(&session_id, Arc::new(NullSink))
        .await
        .expect("bind sink");

    bob.accept_incoming(&session_id).await.expect("accept");
    wait_update(&mut alice_updates, |u| u.phase.is_active()).await;
    wait_update(&mut bob_updates, |u| u.phase.is_active()).await;

    // Accepting anything else while a call is live is a busy condition.
    assert!(matches!(
        bob.accept_incoming(&SessionId::generate()).await,
        Err(CallError::CallInProgress)
    ));

    // Mute shows up in the next snapshot without touching the phase.
    alice.toggle_mute(&session_id).await.expect("mute");
    let muted = wait_update(&mut alice_updates, |u| u.media.muted).await;
    assert!(muted.phase.is_active());

    // Speaker routing goes through both the device and the peer transport.
    alice.toggle_speaker(&session_id).await.expect("speaker");
    let speaker = wait_update(&mut alice_updates, |u| u.media.speaker_on).await;
    assert!(speaker.phase.is_active());

    bob.hangup(&session_id).await.expect("hangup");
    let alice_end = wait_update(&mut alice_updates, |u| u.phase.is_ended()).await;
    assert_eq!(alice_end.end_reason, Some(EndReason::RemoteHangup));
    let bob_end = wait_update(&mut bob_updates, |u| u.phase.is_ended()).await;
    assert_eq!(bob_end.end_reason, Some(EndReason::LocalHangup));

    // Every path released exactly what it acquired.
    assert_eq!(alice_media.held(), 0);
    assert_eq!(bob_media.held(), 0);
}

#[tokio::test]
async fn test_decline_ends_both_sides() {
    let relay = MemoryRelay::new();
    let (alice, alice_media) = engine_for(&relay, "alice");
    let (bob, bob_media) = engine_for(&relay, "bob");

    let mut alice_updates = alice.events().call_update.subscribe();
    let mut bob_updates = bob.events().call_update.subscribe();
    let mut bob_incoming = bob.events().incoming_call.subscribe();

    let session_id = alice
        .place_call(UserId::from("bob"), false)
        .await
        .expect("place call");
    wait_incoming(&mut bob_incoming).await;

    bob.decline_incoming(&session_id).await.expect("decline");

    let alice_end = wait_update(&mut alice_updates, |u| u.phase.is_ended()).await;
    assert_eq!(alice_end.end_reason, Some(EndReason::Declined));
    let bob_end = wait_update(&mut bob_updates, |u| u.phase.is_ended()).await;
    assert_eq!(bob_end.end_reason, Some(EndReason::Declined));

    // The callee never accepted, so it never touched the devices.
    assert_eq!(alice_media.held(), 0);
    assert_eq!(bob_media.held(), 0);
}

#[tokio::test]
async fn test_second_caller_gets_busy() {
    let relay = MemoryRelay::new();
    let (alice, _alice_media) = engine_for(&relay, "alice");
    let (bob, _bob_media) = engine_for(&relay, "bob");
    let (carol, carol_media) = engine_for(&relay, "carol");

    let session_id = establish_call(&alice, &bob, "bob").await;

    // Carol rings a busy callee: automatic rejection, no session on Bob's
    // side, no ringing.
    let mut carol_updates = carol.events().call_update.subscribe();
    carol
        .place_call(UserId::from("bob"), false)
        .await
        .expect("place call");
    let carol_end = wait_update(&mut carol_updates, |u| u.phase.is_ended()).await;
    assert_eq!(carol_end.end_reason, Some(EndReason::Declined));
    assert_eq!(carol_media.held(), 0);

    // The established call was untouched.
    bob.hangup(&session_id).await.expect("hangup");
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let relay = MemoryRelay::new();
    let (alice, alice_media) = engine_for(&relay, "alice");
    let mut updates = alice.events().call_update.subscribe();

    // "ghost" has no transport registered; the invite is silently dropped
    // by the relay and nothing ever answers.
    alice
        .place_call(UserId::from("ghost"), false)
        .await
        .expect("place call");

    let end = wait_update(&mut updates, |u| u.phase.is_ended()).await;
    assert_eq!(end.end_reason, Some(EndReason::Timeout));
    assert_eq!(alice_media.held(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ignored_incoming_call_declines_on_timeout() {
    let relay = MemoryRelay::new();
    // The caller rings longer than the callee, so the callee's timeout
    // decline is what ends the caller's side.
    let alice_config = EngineConfig {
        ring_timeout: Duration::from_secs(90),
        ..EngineConfig::default()
    };
    let (alice, _alice_media) = engine_with_config(&relay, "alice", alice_config);
    let (bob, bob_media) = engine_for(&relay, "bob");

    let mut alice_updates = alice.events().call_update.subscribe();
    let mut bob_updates = bob.events().call_update.subscribe();
    let mut bob_incoming = bob.events().incoming_call.subscribe();

    alice
        .place_call(UserId::from("bob"), false)
        .await
        .expect("place call");
    wait_incoming(&mut bob_incoming).await;
    // Nobody picks up.

    let bob_end = wait_update(&mut bob_updates, |u| u.phase.is_ended()).await;
    assert_eq!(bob_end.end_reason, Some(EndReason::Timeout));
    let alice_end = wait_update(&mut alice_updates, |u| u.phase.is_ended()).await;
    assert_eq!(alice_end.end_reason, Some(EndReason::Declined));
    assert_eq!(bob_media.held(), 0);
}

#[tokio::test]
async fn test_capture_failure_fails_the_call() {
    let relay = MemoryRelay::new();
    let (alice, alice_media) = engine_for(&relay, "alice");
    alice_media.set_fail_acquire(true);

    let mut updates = alice.events().call_update.subscribe();
    alice
        .place_call(UserId::from("bob"), true)
        .await
        .expect("place call");

    let end = wait_update(&mut updates, |u| u.phase.is_ended()).await;
    assert!(matches!(end.end_reason, Some(EndReason::Failed(_))));
    assert_eq!(alice_media.held(), 0);
}

#[tokio::test]
async fn test_stray_candidate_after_end_is_ignored() {
    let relay = MemoryRelay::new();
    let (alice, _alice_media) = engine_for(&relay, "alice");
    let (bob, _bob_media) = engine_for(&relay, "bob");

    let mut alice_updates = alice.events().call_update.subscribe();
    let mut bob_incoming = bob.events().incoming_call.subscribe();

    let session_id = alice
        .place_call(UserId::from("bob"), false)
        .await
        .expect("place call");
    wait_incoming(&mut bob_incoming).await;
    bob.decline_incoming(&session_id).await.expect("decline");
    wait_update(&mut alice_updates, |u| u.phase.is_ended()).await;

    // A candidate for the dead session shows up late, injected from a raw
    // transport so it bypasses both engines.
    let (eve, _eve_events) = relay
        .factory(UserId::from("eve"))
        .create_transport()
        .await
        .expect("transport");
    let stray = SignalingMessage::new(
        session_id.clone(),
        UserId::from("bob"),
        UserId::from("alice"),
        99,
        SignalingBody::IceCandidate {
            candidate: IceCandidate::new("candidate:9 1 UDP 1 203.0.113.9 9999 typ host"),
        },
    );
    eve.send(&stray.encode()).await.expect("send");

    // Discarded without an error and without reviving anything: a fresh
    // call starts cleanly under a new id.
    let second = alice
        .place_call(UserId::from("bob"), false)
        .await
        .expect("second call");
    assert_ne!(second, session_id);
    let ringing = wait_incoming(&mut bob_incoming).await;
    assert_eq!(ringing.session_id, second);
}

/// Transport that rejects the first `invite` frame it sees and behaves
/// normally afterwards.
struct FlakyInviteTransport {
    inner: Arc<dyn Transport>,
    tripped: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Transport for FlakyInviteTransport {
    async fn send(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
        if !self.tripped.load(Ordering::SeqCst)
            && let Some(msg) = SignalingMessage::decode(frame)
            && matches!(msg.body, SignalingBody::Invite { .. })
        {
            self.tripped.store(true, Ordering::SeqCst);
            anyhow::bail!("transient relay error");
        }
        self.inner.send(frame).await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await;
    }
}

struct FlakyInviteFactory {
    inner: MemoryTransportFactory,
    tripped: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl TransportFactory for FlakyInviteFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let (inner, events) = self.inner.create_transport().await?;
        Ok((
            Arc::new(FlakyInviteTransport {
                inner,
                tripped: Arc::clone(&self.tripped),
            }),
            events,
        ))
    }
}

#[tokio::test]
async fn test_retried_invite_never_arrives_after_the_offer() {
    let relay = MemoryRelay::new();
    // The caller's first invite send fails transiently. The retried invite
    // must still reach the callee before the offer; a reordering here
    // leaves the callee with a session that never gets an offer and both
    // sides dying on timers.
    let alice = CallEngine::new(
        UserId::from("alice"),
        EngineConfig::default(),
        Box::new(FlakyInviteFactory {
            inner: relay.factory(UserId::from("alice")),
            tripped: Arc::new(AtomicBool::new(false)),
        }),
        Arc::new(SimPeerFactory::default()),
        SimMedia::new(),
    );
    let (bob, _bob_media) = engine_for(&relay, "bob");

    establish_call(&alice, &bob, "bob").await;
}

#[tokio::test(start_paused = true)]
async fn test_ice_disconnect_beyond_grace_fails_the_call() {
    let relay = MemoryRelay::new();
    let alice_peers = Arc::new(SimPeerFactory::default());
    let alice_media = SimMedia::new();
    let alice = CallEngine::new(
        UserId::from("alice"),
        EngineConfig::default(),
        Box::new(relay.factory(UserId::from("alice"))),
        alice_peers.clone(),
        alice_media.clone(),
    );
    let (bob, _bob_media) = engine_for(&relay, "bob");

    let mut alice_updates = alice.events().call_update.subscribe();
    establish_call(&alice, &bob, "bob").await;

    let peer = alice_peers.created().first().cloned().expect("peer exists");
    peer.inject(PeerEvent::IceDisconnected);

    // Nothing recovers; the grace window runs out.
    let end = wait_update(&mut alice_updates, |u| u.phase.is_ended()).await;
    assert!(matches!(end.end_reason, Some(EndReason::Failed(_))));
    assert_eq!(alice_media.held(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ice_reconnect_within_grace_keeps_call_active() {
    let relay = MemoryRelay::new();
    let alice_peers = Arc::new(SimPeerFactory::default());
    let alice = CallEngine::new(
        UserId::from("alice"),
        EngineConfig::default(),
        Box::new(relay.factory(UserId::from("alice"))),
        alice_peers.clone(),
        SimMedia::new(),
    );
    let (bob, _bob_media) = engine_for(&relay, "bob");

    let mut alice_updates = alice.events().call_update.subscribe();
    let session_id = establish_call(&alice, &bob, "bob").await;

    let peer = alice_peers.created().first().cloned().expect("peer exists");
    peer.inject(PeerEvent::IceDisconnected);
    peer.inject(PeerEvent::IceConnected);

    // Well past the grace window: the recovered call must still be up and
    // end only on the explicit hangup.
    sleep(Duration::from_secs(30)).await;
    alice.hangup(&session_id).await.expect("hangup");
    let end = wait_update(&mut alice_updates, |u| u.phase.is_ended()).await;
    assert_eq!(end.end_reason, Some(EndReason::LocalHangup));
}
