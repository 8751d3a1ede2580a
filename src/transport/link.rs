//! Reconnecting signaling link.
//!
//! Owns the live [`Transport`], reconnects with bounded backoff when it
//! drops, publishes connectivity over a watch channel and decodes inbound
//! frames into [`SignalingMessage`]s. Outbound delivery is best effort
//! within a bounded window: past it the caller gets
//! [`CallError::TransportUnavailable`] and must decide what that means for
//! the session (for a `hangup`/`decline` it means `Ended(Failed)`).

use super::{ConnectionState, Transport, TransportEvent, TransportFactory};
use crate::error::CallError;
use crate::signaling::SignalingMessage;
use log::{debug, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, RwLock, mpsc, watch};
use tokio::time::{Instant, sleep};

const INBOUND_CHANNEL_CAPACITY: usize = 100;
const SEND_RETRY_PAUSE: Duration = Duration::from_millis(100);

pub struct SignalingLink {
    current: RwLock<Option<Arc<dyn Transport>>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: Notify,
    shutting_down: AtomicBool,
    reconnect_max_delay: Duration,
}

impl SignalingLink {
    /// Spawns the link's connection loop. Returns the link handle and the
    /// stream of decoded inbound messages.
    pub fn spawn(
        factory: Box<dyn TransportFactory>,
        reconnect_max_delay: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<SignalingMessage>) {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        let link = Arc::new(Self {
            current: RwLock::new(None),
            state_tx,
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
            reconnect_max_delay,
        });

        let run_link = Arc::clone(&link);
        tokio::spawn(async move {
            run_link.run(factory, inbound_tx).await;
        });

        (link, inbound_rx)
    }

    /// Watchable connectivity of the link.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Deliver one message within the bounded window.
    ///
    /// At-least-once: a retried send may duplicate a frame, the receiver's
    /// sequence gate absorbs that.
    pub async fn send_within(
        &self,
        msg: &SignalingMessage,
        window: Duration,
    ) -> Result<(), CallError> {
        let frame = msg.encode();
        let deadline = Instant::now() + window;
        let mut state_rx = self.state_tx.subscribe();

        loop {
            let transport = self.current.read().await.clone();
            if let Some(transport) = transport {
                match transport.send(&frame).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        debug!(target: "Engine/Link", "Send attempt failed: {e}, will retry");
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CallError::TransportUnavailable(format!(
                    "could not deliver {} within {:?}",
                    msg.body, window
                )));
            }
            let remaining = deadline - now;

            // Pause briefly, or wake early on a connectivity change.
            let pause = remaining.min(SEND_RETRY_PAUSE);
            tokio::select! {
                _ = sleep(pause) => {}
                _ = state_rx.changed() => {}
            }
        }
    }

    /// Stops the connection loop and closes the transport.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.shutdown.notify_waiters();
        if let Some(transport) = self.current.write().await.take() {
            transport.disconnect().await;
        }
        let _ = self.state_tx.send(ConnectionState::Disconnected);
    }

    async fn run(
        self: Arc<Self>,
        factory: Box<dyn TransportFactory>,
        inbound_tx: mpsc::Sender<SignalingMessage>,
    ) {
        let mut errors: u32 = 0;

        while !self.shutting_down.load(Ordering::Relaxed) {
            match factory.create_transport().await {
                Ok((transport, events)) => {
                    errors = 0;
                    *self.current.write().await = Some(Arc::clone(&transport));
                    self.pump_events(events, &inbound_tx).await;
                    *self.current.write().await = None;

                    if self.shutting_down.load(Ordering::Relaxed) {
                        break;
                    }
                    let _ = self.state_tx.send(ConnectionState::Reconnecting);
                    warn!(target: "Engine/Link", "Signaling connection lost, will reconnect");
                }
                Err(e) => {
                    let _ = self.state_tx.send(ConnectionState::Reconnecting);
                    warn!(target: "Engine/Link", "Failed to connect to relay: {e}");
                }
            }

            errors += 1;
            let delay = self.backoff_delay(errors);
            info!(
                target: "Engine/Link",
                "Will attempt to reconnect in {:?} (attempt {})", delay, errors
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.notified() => break,
            }
        }

        let _ = self.state_tx.send(ConnectionState::Disconnected);
        info!(target: "Engine/Link", "Signaling link shut down");
    }

    /// Reads transport events until the connection drops or shutdown.
    async fn pump_events(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
        inbound_tx: &mpsc::Sender<SignalingMessage>,
    ) {
        loop {
            let event = tokio::select! {
                ev = events.recv() => ev,
                _ = self.shutdown.notified() => return,
            };
            match event {
                Some(TransportEvent::Connected) => {
                    info!(target: "Engine/Link", "Signaling connection established");
                    let _ = self.state_tx.send(ConnectionState::Connected);
                }
                Some(TransportEvent::FrameReceived(frame)) => {
                    match SignalingMessage::decode(&frame) {
                        Some(msg) => {
                            if inbound_tx.send(msg).await.is_err() {
                                warn!(target: "Engine/Link", "Inbound receiver dropped, stopping pump");
                                return;
                            }
                        }
                        None => {
                            // Unknown message types are ignored for forward
                            // compatibility.
                            debug!(
                                target: "Engine/Link",
                                "Ignoring undecodable frame ({} bytes)", frame.len()
                            );
                        }
                    }
                }
                Some(TransportEvent::Disconnected) | None => return,
            }
        }
    }

    fn backoff_delay(&self, errors: u32) -> Duration {
        let base = Duration::from_secs(u64::from(errors) * 2).min(self.reconnect_max_delay);
        let jitter = Duration::from_millis(rand::rng().random_range(0..500));
        base + jitter
    }
}
