//! Runtime tuning configuration for a [`crate::node::Node`].
//!
//! Mirrors the reference's builder-and-validate pattern: construct via
//! [`RaftConfig::build`], tune with the `with_*` setters, then call
//! [`Builder::validate`] once to obtain an immutable, `Arc`-shareable config.

use std::sync::Arc;

use thiserror::Error;

use crate::clock::Rand;

/// Errors produced while validating a [`Builder`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("election_timeout_min must be less than election_timeout_max")]
    InvalidElectionTimeoutRange,
    #[error("heartbeat_interval must be less than election_timeout_min to avoid spurious elections")]
    HeartbeatIntervalTooLarge,
    #[error("max_entry_size must be greater than zero")]
    InvalidMaxEntrySize,
}

/// Immutable, validated runtime configuration.
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// A human-readable cluster name, used only for tracing/log context.
    pub cluster_name: String,
    /// Lower bound, in milliseconds, of the randomized election timeout.
    pub election_timeout_min: u64,
    /// Upper bound, in milliseconds, of the randomized election timeout.
    pub election_timeout_max: u64,
    /// Cadence, in milliseconds, at which a leader sends heartbeats to each peer.
    pub heartbeat_interval: u64,
    /// The largest `data_len` the entry codec will accept before failing with `Oversize`.
    pub max_entry_size: usize,
}

impl RaftConfig {
    /// Start building a new config for the named cluster.
    pub fn build(cluster_name: impl Into<String>) -> Builder {
        Builder {
            cluster_name: cluster_name.into(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_entry_size: 16 * 1024 * 1024,
        }
    }

    /// Draw a random election timeout, in milliseconds, within the configured
    /// range, through the injected [`Rand`] so tests can make jitter
    /// deterministic (§4.7, §9).
    pub fn new_rand_election_timeout(&self, rand: &impl Rand) -> u64 {
        rand.gen_range(self.election_timeout_min, self.election_timeout_max)
    }
}

/// A builder for [`RaftConfig`], validated exactly once via [`Builder::validate`].
pub struct Builder {
    cluster_name: String,
    election_timeout_min: u64,
    election_timeout_max: u64,
    heartbeat_interval: u64,
    max_entry_size: usize,
}

impl Builder {
    pub fn election_timeout_min(mut self, v: u64) -> Self {
        self.election_timeout_min = v;
        self
    }

    pub fn election_timeout_max(mut self, v: u64) -> Self {
        self.election_timeout_max = v;
        self
    }

    pub fn heartbeat_interval(mut self, v: u64) -> Self {
        self.heartbeat_interval = v;
        self
    }

    pub fn max_entry_size(mut self, v: usize) -> Self {
        self.max_entry_size = v;
        self
    }

    /// Validate the accumulated settings and produce a shareable [`RaftConfig`].
    pub fn validate(self) -> Result<Arc<RaftConfig>, ConfigError> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutRange);
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatIntervalTooLarge);
        }
        if self.max_entry_size == 0 {
            return Err(ConfigError::InvalidMaxEntrySize);
        }
        Ok(Arc::new(RaftConfig {
            cluster_name: self.cluster_name,
            election_timeout_min: self.election_timeout_min,
            election_timeout_max: self.election_timeout_max,
            heartbeat_interval: self.heartbeat_interval,
            max_entry_size: self.max_entry_size,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_election_timeout_range() {
        let err = RaftConfig::build("test")
            .election_timeout_min(300)
            .election_timeout_max(150)
            .validate()
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidElectionTimeoutRange);
    }

    #[test]
    fn rejects_heartbeat_slower_than_election_floor() {
        let err = RaftConfig::build("test")
            .election_timeout_min(100)
            .heartbeat_interval(200)
            .validate()
            .unwrap_err();
        assert_eq!(err, ConfigError::HeartbeatIntervalTooLarge);
    }

    #[test]
    fn default_settings_validate() {
        assert!(RaftConfig::build("test").validate().is_ok());
    }
}
