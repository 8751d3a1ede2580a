//! Wire protocol for call signaling.
//!
//! Messages are JSON objects exchanged peer-to-peer through the relay. The
//! `type` field is a closed enum: a message with an unrecognized type fails
//! to decode and is dropped by the consumer (forward compatibility), while
//! unknown fields inside a known type are ignored by serde.

use crate::types::call::{IceCandidate, SessionId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One signaling message as carried by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub session_id: SessionId,
    pub from: UserId,
    pub to: UserId,
    /// Monotonically increasing per-session counter assigned by the sender.
    /// Used to drop duplicates and stale replays of gated message types;
    /// candidates are exempt (they may legitimately arrive reordered).
    pub sequence: u64,
    #[serde(flatten)]
    pub body: SignalingBody,
}

/// Type-specific payload of a [`SignalingMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalingBody {
    /// Ring the remote user. Carries whether the caller wants video.
    Invite { video: bool },
    /// The callee accepted; an `Answer` follows.
    Accept,
    /// The callee declined.
    Decline,
    /// SDP offer from the caller.
    Offer { sdp: String },
    /// SDP answer from the callee.
    Answer { sdp: String },
    /// One gathered network candidate.
    IceCandidate { candidate: IceCandidate },
    /// Unilateral teardown of an established or ringing call.
    Hangup,
    /// Automatic rejection: the callee already has a call in flight.
    Busy,
}

impl SignalingBody {
    /// Whether this message type participates in the per-session sequence
    /// gate. Candidates are applied in arrival order but never dropped for
    /// being "stale".
    pub fn is_sequence_gated(&self) -> bool {
        !matches!(self, Self::IceCandidate { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invite { .. } => "invite",
            Self::Accept => "accept",
            Self::Decline => "decline",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::Hangup => "hangup",
            Self::Busy => "busy",
        }
    }
}

impl fmt::Display for SignalingBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

impl SignalingMessage {
    pub fn new(
        session_id: SessionId,
        from: UserId,
        to: UserId,
        sequence: u64,
        body: SignalingBody,
    ) -> Self {
        Self {
            session_id,
            from,
            to,
            sequence,
            body,
        }
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Vec<u8> {
        // Serialization of these types cannot fail.
        serde_json::to_vec(self).expect("signaling message serialization")
    }

    /// Decode a wire frame. `None` for frames that are not valid messages,
    /// including unknown `type` values.
    pub fn decode(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(body: SignalingBody) -> SignalingMessage {
        let msg = SignalingMessage::new(
            SessionId::new("ABCD"),
            UserId::from("alice"),
            UserId::from("bob"),
            7,
            body,
        );
        SignalingMessage::decode(&msg.encode()).expect("decode")
    }

    #[test]
    fn test_offer_round_trip() {
        let msg = round_trip(SignalingBody::Offer {
            sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n".into(),
        });
        assert_eq!(msg.sequence, 7);
        assert!(matches!(msg.body, SignalingBody::Offer { .. }));
    }

    #[test]
    fn test_candidate_not_sequence_gated() {
        let body = SignalingBody::IceCandidate {
            candidate: IceCandidate::new("candidate:1 1 UDP 1 10.0.0.1 4000 typ host"),
        };
        assert!(!body.is_sequence_gated());
        assert!(SignalingBody::Hangup.is_sequence_gated());
        assert!(SignalingBody::Invite { video: false }.is_sequence_gated());
    }

    #[test]
    fn test_unknown_type_is_dropped() {
        let raw = br#"{"session_id":"X","from":"a","to":"b","sequence":1,"type":"hold","payload":null}"#;
        assert!(SignalingMessage::decode(raw).is_none());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let raw = br#"{"session_id":"X","from":"a","to":"b","sequence":3,"type":"accept","relay_hint":"eu-west"}"#;
        let msg = SignalingMessage::decode(raw).expect("decode");
        assert_eq!(msg.body, SignalingBody::Accept);
    }

    #[test]
    fn test_garbage_is_dropped() {
        assert!(SignalingMessage::decode(b"not json").is_none());
        assert!(SignalingMessage::decode(b"{}").is_none());
    }
}
