//! Retry, backoff and cooldown settings of a room.

use std::time::Duration;

use serde::Deserialize;

/// Timing constants for endpoint creation, peer connection, host election and
/// re-host cooldown. Every field has a default, so a partial TOML table works.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RoomConfig {
    /// Window for the first endpoint open; doubles every attempt (default 2000).
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    /// Endpoint creation retries after the first attempt (default 4).
    #[serde(default = "default_create_retry_limit")]
    pub create_retry_limit: u32,
    /// Backoff base after a retryable endpoint error (default 500).
    #[serde(default = "default_create_retry_base_ms")]
    pub create_retry_base_ms: u64,
    /// Base of the parallel connect schedule (default 1000).
    #[serde(default = "default_connect_base_timeout_ms")]
    pub connect_base_timeout_ms: u64,
    /// Extra parallel connect attempts (default 5).
    #[serde(default = "default_connect_retry_limit")]
    pub connect_retry_limit: u32,
    /// Claim/join cycles before giving up on a room (default 60).
    #[serde(default = "default_election_retry_limit")]
    pub election_retry_limit: u32,
    /// Pause between election cycles (default 1000).
    #[serde(default = "default_election_retry_delay_ms")]
    pub election_retry_delay_ms: u64,
    /// A room that stopped hosting less than this long ago rejoins as participant first (default 3000).
    #[serde(default = "default_rehost_cooldown_ms")]
    pub rehost_cooldown_ms: u64,
}

fn default_open_timeout_ms() -> u64 {
    2_000
}
fn default_create_retry_limit() -> u32 {
    4
}
fn default_create_retry_base_ms() -> u64 {
    500
}
fn default_connect_base_timeout_ms() -> u64 {
    1_000
}
fn default_connect_retry_limit() -> u32 {
    5
}
fn default_election_retry_limit() -> u32 {
    60
}
fn default_election_retry_delay_ms() -> u64 {
    1_000
}
fn default_rehost_cooldown_ms() -> u64 {
    3_000
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: default_open_timeout_ms(),
            create_retry_limit: default_create_retry_limit(),
            create_retry_base_ms: default_create_retry_base_ms(),
            connect_base_timeout_ms: default_connect_base_timeout_ms(),
            connect_retry_limit: default_connect_retry_limit(),
            election_retry_limit: default_election_retry_limit(),
            election_retry_delay_ms: default_election_retry_delay_ms(),
            rehost_cooldown_ms: default_rehost_cooldown_ms(),
        }
    }
}

impl RoomConfig {
    /// Open window for endpoint creation attempt `attempt` (0-based).
    pub fn open_timeout(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.open_timeout_ms.saturating_mul(pow2(attempt)))
    }

    /// Backoff after a retryable error on attempt `attempt`.
    pub fn create_retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.create_retry_base_ms.saturating_mul(pow2(attempt)))
    }

    /// Offsets (from the first attempt) at which further connect attempts are issued:
    /// `base * (2^(i+1) - 1)`.
    pub fn connect_retry_offsets(&self) -> Vec<Duration> {
        (0..self.connect_retry_limit)
            .map(|i| {
                let factor = pow2(i + 1).saturating_sub(1);
                Duration::from_millis(self.connect_base_timeout_ms.saturating_mul(factor))
            })
            .collect()
    }

    /// Hard deadline for a peer connection: `base * 2^limit`.
    pub fn connect_deadline(&self) -> Duration {
        Duration::from_millis(
            self.connect_base_timeout_ms
                .saturating_mul(pow2(self.connect_retry_limit)),
        )
    }

    pub fn election_retry_delay(&self) -> Duration {
        Duration::from_millis(self.election_retry_delay_ms)
    }

    pub fn rehost_cooldown(&self) -> Duration {
        Duration::from_millis(self.rehost_cooldown_ms)
    }

    /// Longest a failover can take: every election cycle plus one peer
    /// connection deadline. Saturates instead of overflowing.
    pub fn failover_window(&self) -> Duration {
        let cycles = self
            .election_retry_delay_ms
            .saturating_mul(u64::from(self.election_retry_limit));
        Duration::from_millis(cycles).saturating_add(self.connect_deadline())
    }
}

fn pow2(exp: u32) -> u64 {
    1u64.checked_shl(exp).unwrap_or(u64::MAX)
}
