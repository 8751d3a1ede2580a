//! Duplicate and replay suppression for gated signaling messages.

use crate::signaling::message::SignalingMessage;
use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks the highest sequence number accepted for one session.
///
/// Gated message types (`invite`, `accept`, `decline`, `offer`, `answer`,
/// `hangup`, `busy`) must carry a strictly increasing sequence; duplicates
/// and stale replays are dropped before they reach the state machine.
/// `ice_candidate` messages bypass the gate entirely.
#[derive(Debug, Default)]
pub struct SequenceGate {
    last_seen: AtomicU64,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the message should be delivered to the session.
    pub fn admit(&self, msg: &SignalingMessage) -> bool {
        if !msg.body.is_sequence_gated() {
            return true;
        }
        // Single consumer per session, but fetch_max keeps this correct even
        // if the router is ever sharded.
        let prev = self.last_seen.fetch_max(msg.sequence, Ordering::AcqRel);
        prev < msg.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::message::SignalingBody;
    use crate::types::call::{IceCandidate, SessionId, UserId};

    fn msg(sequence: u64, body: SignalingBody) -> SignalingMessage {
        SignalingMessage::new(
            SessionId::new("S"),
            UserId::from("a"),
            UserId::from("b"),
            sequence,
            body,
        )
    }

    #[test]
    fn test_duplicates_and_stale_are_dropped() {
        let gate = SequenceGate::new();
        assert!(gate.admit(&msg(1, SignalingBody::Invite { video: false })));
        assert!(gate.admit(&msg(2, SignalingBody::Offer { sdp: "x".into() })));
        // Duplicate
        assert!(!gate.admit(&msg(2, SignalingBody::Offer { sdp: "x".into() })));
        // Stale replay
        assert!(!gate.admit(&msg(1, SignalingBody::Invite { video: false })));
        // Progress resumes
        assert!(gate.admit(&msg(5, SignalingBody::Hangup)));
        assert!(!gate.admit(&msg(4, SignalingBody::Hangup)));
    }

    #[test]
    fn test_candidates_bypass_the_gate() {
        let gate = SequenceGate::new();
        assert!(gate.admit(&msg(10, SignalingBody::Accept)));
        // A candidate with an older sequence is still admitted.
        let cand = SignalingBody::IceCandidate {
            candidate: IceCandidate::new("candidate:1"),
        };
        assert!(gate.admit(&msg(3, cand.clone())));
        assert!(gate.admit(&msg(3, cand)));
    }
}
