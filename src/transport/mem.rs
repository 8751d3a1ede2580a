//! In-process relay transport.
//!
//! Routes frames between registered users on the envelope's `to` field, the
//! same contract the real relay provides. Used by the scenario tests and the
//! loopback demo; delivery is best effort, frames for unregistered users are
//! dropped.

use super::{Transport, TransportEvent, TransportFactory};
use crate::signaling::SignalingMessage;
use crate::types::call::UserId;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, trace};
use std::sync::Arc;
use tokio::sync::mpsc;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Shared routing table for a set of in-process peers.
#[derive(Default)]
pub struct MemoryRelay {
    users: DashMap<UserId, mpsc::Sender<TransportEvent>>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport factory for one user of this relay.
    pub fn factory(self: &Arc<Self>, user: UserId) -> MemoryTransportFactory {
        MemoryTransportFactory {
            relay: Arc::clone(self),
            user,
        }
    }

    fn route(&self, frame: &[u8]) {
        let Some(msg) = SignalingMessage::decode(frame) else {
            debug!(target: "Transport/Mem", "Dropping undecodable frame ({} bytes)", frame.len());
            return;
        };
        match self.users.get(&msg.to) {
            Some(tx) => {
                trace!(
                    target: "Transport/Mem",
                    "Relaying {} from {} to {}",
                    msg.body, msg.from, msg.to
                );
                let _ = tx.try_send(TransportEvent::FrameReceived(Bytes::copy_from_slice(frame)));
            }
            None => {
                debug!(target: "Transport/Mem", "No such user {}, dropping {}", msg.to, msg.body);
            }
        }
    }
}

pub struct MemoryTransport {
    relay: Arc<MemoryRelay>,
    user: UserId,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
        if !self.relay.users.contains_key(&self.user) {
            return Err(anyhow::anyhow!("transport is disconnected"));
        }
        self.relay.route(frame);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some((_, tx)) = self.relay.users.remove(&self.user) {
            let _ = tx.try_send(TransportEvent::Disconnected);
        }
    }
}

pub struct MemoryTransportFactory {
    relay: Arc<MemoryRelay>,
    user: UserId,
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.relay.users.insert(self.user.clone(), event_tx.clone());
        let _ = event_tx.send(TransportEvent::Connected).await;

        let transport = Arc::new(MemoryTransport {
            relay: Arc::clone(&self.relay),
            user: self.user.clone(),
        });
        Ok((transport, event_rx))
    }
}
