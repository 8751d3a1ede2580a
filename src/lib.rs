//! Real-time call negotiation engine.
//!
//! Drives one-to-one audio/video call setup and teardown for a local user:
//! the call state machine, the JSON signaling protocol carried over a
//! reconnecting relay link, the offer/answer and ICE candidate
//! choreography, and the lifecycle of local media resources. The actual
//! media plane is behind the [`calls::peer::PeerConnection`] seam; this
//! crate never touches packets.
//!
//! Entry point is [`CallEngine`]: feed it intents, observe progress on its
//! [`types::events::EventBus`].

pub mod calls;
pub mod config;
pub mod error;
pub mod signaling;
pub mod transport;
pub mod types;

pub use calls::CallEngine;
pub use config::EngineConfig;
pub use error::CallError;
