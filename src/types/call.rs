use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier for one call attempt. Assigned at session creation and
/// never reused; stray signaling for an old id is dropped, not re-bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random session id (32 hex chars).
    pub fn generate() -> Self {
        let raw: u128 = rand::rng().random();
        Self(format!("{raw:032X}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier for a user as known to the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which side of the offer/answer exchange this session plays.
///
/// Fixed at session creation: a `Callee` never initiates an SDP offer and a
/// `Caller` never answers one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Why a session ended. Recorded exactly once, on the transition into the
/// terminal phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Declined,
    Failed(String),
    Timeout,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHangup => write!(f, "local hangup"),
            Self::RemoteHangup => write!(f, "remote hangup"),
            Self::Declined => write!(f, "declined"),
            Self::Failed(cause) => write!(f, "failed: {cause}"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Local capture/routing flags. Mutable by local user intents only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LocalMediaState {
    pub video_enabled: bool,
    pub muted: bool,
    pub speaker_on: bool,
}

impl LocalMediaState {
    pub fn new(video: bool) -> Self {
        Self {
            video_enabled: video,
            muted: false,
            speaker_on: false,
        }
    }
}

/// A single ICE candidate as exchanged between peers.
///
/// The candidate string follows RFC 5245 (e.g.
/// `candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }
}
