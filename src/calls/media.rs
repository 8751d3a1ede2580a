//! Device boundary: local capture and audio routing.
//!
//! The camera and microphone are singleton resources; the engine guarantees
//! only one session holds them at a time and that every path into a
//! terminal phase releases them exactly once. Platform backends implement
//! this trait; the engine only drives it.

use crate::error::CallError;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

#[async_trait]
pub trait MediaController: Send + Sync {
    /// Start local capture. May suspend on permission prompts or hardware
    /// init; failures map to `DeviceUnavailable`.
    async fn acquire(&self, video: bool) -> Result<(), CallError>;

    /// Stop local capture and free the devices. Must tolerate being called
    /// at most once per acquire; the engine never double-releases.
    fn release(&self);

    async fn set_muted(&self, muted: bool) -> Result<(), CallError>;
    async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError>;
    async fn switch_camera(&self) -> Result<(), CallError>;
    async fn set_speaker(&self, on: bool) -> Result<(), CallError>;
}

/// Counting in-memory device backend for tests and demos.
///
/// Tracks the acquire/release balance so leak and double-release bugs show
/// up as a nonzero count.
#[derive(Default)]
pub struct SimMedia {
    held: AtomicI64,
    fail_acquire: AtomicBool,
}

impl SimMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent acquisitions fail with `DeviceUnavailable`.
    pub fn set_fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::Relaxed);
    }

    /// Outstanding acquisitions. Zero when every path released.
    pub fn held(&self) -> i64 {
        self.held.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaController for SimMedia {
    async fn acquire(&self, _video: bool) -> Result<(), CallError> {
        if self.fail_acquire.load(Ordering::Relaxed) {
            return Err(CallError::DeviceUnavailable("capture device busy".into()));
        }
        self.held.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.held.fetch_sub(1, Ordering::SeqCst);
    }

    async fn set_muted(&self, _muted: bool) -> Result<(), CallError> {
        Ok(())
    }

    async fn set_video_enabled(&self, _enabled: bool) -> Result<(), CallError> {
        Ok(())
    }

    async fn switch_camera(&self) -> Result<(), CallError> {
        Ok(())
    }

    async fn set_speaker(&self, _on: bool) -> Result<(), CallError> {
        Ok(())
    }
}
