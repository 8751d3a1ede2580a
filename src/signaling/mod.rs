//! Signaling wire protocol and delivery hygiene.

mod message;
mod sequence;

pub use message::{SignalingBody, SignalingMessage};
pub use sequence::SequenceGate;
