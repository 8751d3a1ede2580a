//! Call session aggregate and its state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::call::{CallRole, EndReason, LocalMediaState, SessionId, UserId};
use crate::types::events::CallUpdate;

use super::ice::CandidateBuffer;

/// Current phase of a call.
///
/// `Idle` has no representation here: with no call in flight there is no
/// session at all. `Ended` is terminal; a new call needs a new session id.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum CallPhase {
    /// Caller side: invite/offer sent, waiting for the callee's decision.
    Outgoing { since: DateTime<Utc> },
    /// Callee side: ringing locally, waiting for a local decision.
    Incoming { since: DateTime<Utc> },
    /// Both sides committed, establishing the media path.
    Connecting { accepted_at: DateTime<Utc> },
    /// Media flowing.
    Active { connected_at: DateTime<Utc> },
    /// Terminal.
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallPhase {
    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Outgoing { .. } | Self::Incoming { .. })
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Incoming { .. })
    }

    pub fn can_decline(&self) -> bool {
        matches!(self, Self::Incoming { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Outgoing { .. } => "outgoing",
            Self::Incoming { .. } => "incoming",
            Self::Connecting { .. } => "connecting",
            Self::Active { .. } => "active",
            Self::Ended { .. } => "ended",
        }
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// The remote callee accepted our invite.
    RemoteAccepted,
    /// The local user accepted an incoming invite.
    LocalAccepted,
    /// Media path established (ICE connected or first remote track).
    MediaConnected,
    /// Terminal transition; valid from every non-ended phase.
    Terminated { reason: EndReason },
}

/// Attempted transition not listed in the state machine's edge table.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_phase: &'static str,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in phase {}",
            self.attempted, self.current_phase
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// The aggregate for one call attempt. Owned by exactly one session task;
/// nothing outside that task mutates it.
#[derive(Debug)]
pub struct CallSession {
    pub session_id: SessionId,
    pub local_user: UserId,
    pub remote_user: UserId,
    pub role: CallRole,
    pub phase: CallPhase,
    pub media: LocalMediaState,
    pub remote_track_bound: bool,
    pub candidates: CandidateBuffer,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Offer SDP held by a callee until the local user accepts.
    pub pending_remote_offer: Option<String>,
    next_sequence: u64,
}

impl CallSession {
    pub fn new_outgoing(local_user: UserId, remote_user: UserId, video: bool) -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::generate(),
            local_user,
            remote_user,
            role: CallRole::Caller,
            phase: CallPhase::Outgoing { since: now },
            media: LocalMediaState::new(video),
            remote_track_bound: false,
            candidates: CandidateBuffer::new(),
            created_at: now,
            connected_at: None,
            ended_at: None,
            pending_remote_offer: None,
            next_sequence: 0,
        }
    }

    pub fn new_incoming(
        session_id: SessionId,
        local_user: UserId,
        remote_user: UserId,
        video: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            local_user,
            remote_user,
            role: CallRole::Callee,
            phase: CallPhase::Incoming { since: now },
            media: LocalMediaState::new(video),
            remote_track_bound: false,
            candidates: CandidateBuffer::new(),
            created_at: now,
            connected_at: None,
            ended_at: None,
            pending_remote_offer: None,
            next_sequence: 0,
        }
    }

    /// Next outbound sequence number for this session.
    pub fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// Apply a state transition. Returns an error (and leaves the session
    /// untouched) if the edge is not in the table.
    pub fn apply(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_phase = match (&self.phase, &transition) {
            (CallPhase::Outgoing { .. }, CallTransition::RemoteAccepted) => CallPhase::Connecting {
                accepted_at: Utc::now(),
            },
            (CallPhase::Incoming { .. }, CallTransition::LocalAccepted) => CallPhase::Connecting {
                accepted_at: Utc::now(),
            },
            (CallPhase::Connecting { .. }, CallTransition::MediaConnected) => {
                let now = Utc::now();
                self.connected_at = Some(now);
                CallPhase::Active { connected_at: now }
            }
            (phase, CallTransition::Terminated { reason }) if !phase.is_ended() => {
                let now = Utc::now();
                let duration_secs = self
                    .connected_at
                    .map(|connected| now.signed_duration_since(connected).num_seconds());
                self.ended_at = Some(now);
                CallPhase::Ended {
                    reason: reason.clone(),
                    ended_at: now,
                    duration_secs,
                }
            }
            (phase, attempted) => {
                return Err(InvalidTransition {
                    current_phase: phase.name(),
                    attempted: format!("{attempted:?}"),
                });
            }
        };
        self.phase = new_phase;
        Ok(())
    }

    /// Snapshot for the notification stream.
    pub fn snapshot(&self) -> CallUpdate {
        let end_reason = match &self.phase {
            CallPhase::Ended { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        CallUpdate {
            session_id: self.session_id.clone(),
            remote_user: self.remote_user.clone(),
            phase: self.phase.clone(),
            media: self.media,
            remote_track_bound: self.remote_track_bound,
            end_reason,
        }
    }
}
