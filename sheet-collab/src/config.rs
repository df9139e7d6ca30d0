//! Client configuration.

use std::time::Duration;

/// Configuration for a [`crate::client::CollabClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the multiplayer server.
    pub server_url: String,
    /// Minimum interval between outbound presence updates (fast tick).
    pub update_interval: Duration,
    /// Max quiet time before an explicit heartbeat is sent (slow tick).
    pub heartbeat_interval: Duration,
    /// Fixed delay before a reconnect attempt after transport failure.
    ///
    /// Deliberately fixed rather than exponential: predictable recovery
    /// latency wins over load-shedding for a single-server room topology.
    pub reconnect_delay: Duration,
    /// Minimum interval between repeated backfill requests for the same gap.
    pub backfill_retry: Duration,
    /// Number of distinct display colors; participant color indices wrap
    /// around this value.
    pub palette_size: usize,
    /// Skip credential refresh entirely (anonymous sessions).
    pub anonymous: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            update_interval: Duration::from_millis(33), // 30 Hz
            heartbeat_interval: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(5),
            backfill_retry: Duration::from_secs(5),
            palette_size: 8,
            anonymous: false,
        }
    }
}
