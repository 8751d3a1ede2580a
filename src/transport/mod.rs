//! Transport layer for the persistent signaling connection.
//!
//! A [`Transport`] is one live duplex connection to the relay; the
//! [`SignalingLink`] owns reconnection, backoff and the bounded delivery
//! window on top of whichever transport a [`TransportFactory`] produces.

mod link;
pub mod mem;
mod ws;

pub use link::SignalingLink;
pub use ws::WebSocketTransportFactory;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A frame has been received from the relay.
    FrameReceived(Bytes),
    /// The connection was lost.
    Disconnected,
}

/// Represents an active network connection to the relay.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one frame to the relay.
    async fn send(&self, frame: &[u8]) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Creates a new transport and returns it, along with a stream of events.
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

/// Observable connectivity of the signaling link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

#[cfg(test)]
pub mod mock {
    use super::*;

    /// A transport that swallows every frame, for tests that only exercise
    /// the link machinery. Holding the event sender keeps the link's event
    /// stream open for the transport's lifetime.
    pub struct MockTransport {
        _event_tx: mpsc::Sender<TransportEvent>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, _frame: &[u8]) -> Result<(), anyhow::Error> {
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    #[derive(Default)]
    pub struct MockTransportFactory;

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            let (tx, rx) = mpsc::channel(8);
            let _ = tx.send(TransportEvent::Connected).await;
            Ok((Arc::new(MockTransport { _event_tx: tx }), rx))
        }
    }
}
