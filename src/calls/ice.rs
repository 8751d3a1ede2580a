//! Buffering for ICE candidates gathered or received before the session can
//! consume them.
//!
//! Locally gathered candidates may appear before the local description has
//! been created; remote candidates may arrive before the remote description
//! has been applied. Both sides are queued in order and drained exactly once
//! when the matching description becomes ready; afterwards candidates pass
//! straight through. Duplicates (by value) are ignored on both sides.

use crate::types::call::IceCandidate;

/// What the caller should do with a candidate it just handed to the buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// The description is ready: forward the candidate now.
    Forward(IceCandidate),
    /// Queued until the description is ready.
    Buffered,
    /// Already seen, nothing to do.
    Duplicate,
}

#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending_local: Vec<IceCandidate>,
    pending_remote: Vec<IceCandidate>,
    seen_local: Vec<IceCandidate>,
    seen_remote: Vec<IceCandidate>,
    local_ready: bool,
    remote_ready: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A locally gathered candidate. Forwarded once the local description
    /// exists, buffered otherwise.
    pub fn add_local(&mut self, candidate: IceCandidate) -> CandidateDisposition {
        if self.seen_local.contains(&candidate) {
            return CandidateDisposition::Duplicate;
        }
        self.seen_local.push(candidate.clone());
        if self.local_ready {
            CandidateDisposition::Forward(candidate)
        } else {
            self.pending_local.push(candidate);
            CandidateDisposition::Buffered
        }
    }

    /// A candidate received from the peer. Applied once the remote
    /// description has been applied, buffered otherwise.
    pub fn add_remote(&mut self, candidate: IceCandidate) -> CandidateDisposition {
        if self.seen_remote.contains(&candidate) {
            return CandidateDisposition::Duplicate;
        }
        self.seen_remote.push(candidate.clone());
        if self.remote_ready {
            CandidateDisposition::Forward(candidate)
        } else {
            self.pending_remote.push(candidate);
            CandidateDisposition::Buffered
        }
    }

    /// The local description has been created: returns the buffered local
    /// candidates in gathering order, to be sent now.
    pub fn mark_local_ready(&mut self) -> Vec<IceCandidate> {
        self.local_ready = true;
        std::mem::take(&mut self.pending_local)
    }

    /// The remote description has been applied: returns the buffered remote
    /// candidates in arrival order, to be applied now.
    pub fn mark_remote_ready(&mut self) -> Vec<IceCandidate> {
        self.remote_ready = true;
        std::mem::take(&mut self.pending_remote)
    }
}
