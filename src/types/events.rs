use crate::calls::session::CallPhase;
use crate::transport::ConnectionState;
use crate::types::call::{EndReason, LocalMediaState, SessionId, UserId};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Snapshot of one session, emitted on every state mutation.
///
/// The UI layer observes these instead of poking at call state directly;
/// there is no other read path.
#[derive(Debug, Clone, Serialize)]
pub struct CallUpdate {
    pub session_id: SessionId,
    pub remote_user: UserId,
    pub phase: CallPhase,
    pub media: LocalMediaState,
    pub remote_track_bound: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

/// An inbound invite that created a ringing session.
#[derive(Debug, Clone, Serialize)]
pub struct IncomingCall {
    pub session_id: SessionId,
    pub from: UserId,
    pub video: bool,
}

/// Signaling link connectivity change.
#[derive(Debug, Clone)]
pub struct ConnectionUpdate {
    pub state: ConnectionState,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event type.
        ///
        /// Publishing is fire-and-forget: a send never blocks, and a slow or
        /// absent observer cannot stall call processing.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Call lifecycle
    (call_update, Arc<CallUpdate>),
    (incoming_call, Arc<IncomingCall>),

    // Signaling link
    (connection, Arc<ConnectionUpdate>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Publish a call snapshot, ignoring the no-subscriber case.
    pub fn publish_call_update(&self, update: CallUpdate) {
        let _ = self.call_update.send(Arc::new(update));
    }

    pub fn publish_incoming_call(&self, incoming: IncomingCall) {
        let _ = self.incoming_call.send(Arc::new(incoming));
    }

    pub fn publish_connection(&self, state: ConnectionState) {
        let _ = self.connection.send(Arc::new(ConnectionUpdate { state }));
    }
}
