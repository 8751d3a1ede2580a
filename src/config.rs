use std::time::Duration;

/// Tunable timeouts and windows for the negotiation engine.
///
/// The defaults are conservative; real deployments should tune them against
/// observed network conditions.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a ringing session (either direction) waits for an
    /// accept/decline before ending with `Timeout`.
    pub ring_timeout: Duration,
    /// How long a session may sit in `Connecting` before ending with
    /// `Failed`.
    pub connect_timeout: Duration,
    /// Bounded window for delivering a signaling message across a link
    /// disconnect. Past it the send fails with `TransportUnavailable`.
    pub delivery_window: Duration,
    /// Grace window after an ICE disconnect on an active call before the
    /// session is forced to `Failed`.
    pub ice_disconnect_grace: Duration,
    /// How long an ended session lingers in the registry so late stray
    /// signaling for its id is absorbed silently.
    pub ended_linger: Duration,
    /// Upper bound on the reconnect backoff delay.
    pub reconnect_max_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            delivery_window: Duration::from_secs(10),
            ice_disconnect_grace: Duration::from_secs(5),
            ended_linger: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}
