//! Call negotiation: state machine, per-session tasks and the engine API.

mod engine;
pub mod ice;
pub mod media;
pub mod peer;
pub mod session;
mod task;

#[cfg(test)]
mod protocol_tests;

pub use engine::CallEngine;
pub use ice::{CandidateBuffer, CandidateDisposition};
pub use media::{MediaController, SimMedia};
pub use peer::{PeerConnection, PeerConnectionFactory, PeerEvent, RemoteTrackSink};
pub use session::{CallPhase, CallSession, CallTransition, InvalidTransition};
