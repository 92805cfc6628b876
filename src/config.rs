//! Replay configuration and validation.
//!
//! Defaults follow the operating envelope the pipeline is tuned for; every
//! knob is overridable from the CLI. Validation happens once at startup and
//! any violation is a [`RlxError::Config`] (exit code 1).

use crate::error::{Result, RlxError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What to do with a record whose `origin_time` runs backwards within its
/// own source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutOfOrderPolicy {
    /// Drop the record, log and count it.
    Drop,
    /// Keep the record; it is emitted at its (late) merge position.
    Carry,
}

impl FromStr for OutOfOrderPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "drop" => Ok(OutOfOrderPolicy::Drop),
            "carry" => Ok(OutOfOrderPolicy::Carry),
            other => Err(format!("unknown out-of-order policy {other:?} (drop|carry)")),
        }
    }
}

/// Tunables of one replay run. One instance is shared (by clone) across all
/// per-symbol workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Reader micro-batch size, in records.
    pub batch_size: usize,
    /// Capacity of the channels coupling pipeline stages inside a worker.
    pub channel_capacity: usize,
    /// Capacity of the supervisor's per-worker routing channels.
    pub route_capacity: usize,
    /// Events buffered while waiting for the first snapshot before
    /// `InitializationOverflow` fires.
    pub pending_queue_limit: usize,
    /// Bound on tracked levels per side beyond the authoritative top 20.
    pub overflow_levels: usize,
    /// Checkpoint after this many applied events.
    pub checkpoint_every_events: u64,
    /// Checkpoint after this many seconds.
    pub checkpoint_every_seconds: u64,
    /// Rotate a WAL segment once it grows past this many bytes.
    pub wal_segment_bytes: u64,
    /// Relative RMS drift above which a snapshot raises `HighDriftWarning`.
    pub drift_threshold: f64,
    /// Enriched post-state depth per side.
    pub top_depth: usize,
    /// Policy for per-source `origin_time` regressions.
    pub out_of_order: OutOfOrderPolicy,
    /// Let trades consume into the overflow store once the top levels are
    /// exhausted (default: remainder is recorded as hidden liquidity).
    pub consume_overflow_on_trade: bool,
    /// Seconds the supervisor waits for draining workers before force-close.
    pub drain_deadline_secs: u64,
    /// Base delay of the exponential I/O retry backoff, in milliseconds.
    pub io_retry_base_ms: u64,
    /// Maximum I/O attempts before the fault is persistent.
    pub io_retry_attempts: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        ReplayConfig {
            batch_size: 1_000,
            channel_capacity: 2_000,
            route_capacity: 1_000,
            pending_queue_limit: 4_096,
            overflow_levels: 1_024,
            checkpoint_every_events: 1_000_000,
            checkpoint_every_seconds: 60,
            wal_segment_bytes: 64 * 1024 * 1024,
            drift_threshold: 1e-3,
            top_depth: crate::event::TOP_DEPTH,
            out_of_order: OutOfOrderPolicy::Drop,
            consume_overflow_on_trade: false,
            drain_deadline_secs: 30,
            io_retry_base_ms: 100,
            io_retry_attempts: 5,
        }
    }
}

impl ReplayConfig {
    pub fn validate(&self) -> Result<()> {
        fn bad(msg: impl Into<String>) -> RlxError {
            RlxError::Config(msg.into())
        }
        if self.batch_size == 0 {
            return Err(bad("batch_size must be positive"));
        }
        if self.channel_capacity == 0 || self.route_capacity == 0 {
            return Err(bad("channel capacities must be positive"));
        }
        if self.pending_queue_limit == 0 {
            return Err(bad("pending_queue_limit must be positive"));
        }
        if self.checkpoint_every_events == 0 && self.checkpoint_every_seconds == 0 {
            return Err(bad("at least one checkpoint cadence must be set"));
        }
        if self.top_depth == 0 || self.top_depth > crate::event::TOP_DEPTH {
            return Err(bad(format!(
                "top_depth must be in 1..={}",
                crate::event::TOP_DEPTH
            )));
        }
        if !(self.drift_threshold.is_finite() && self.drift_threshold > 0.0) {
            return Err(bad("drift_threshold must be a positive finite number"));
        }
        if self.wal_segment_bytes < 1024 {
            return Err(bad("wal_segment_bytes unreasonably small"));
        }
        if self.io_retry_attempts == 0 {
            return Err(bad("io_retry_attempts must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ReplayConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_cadence_and_depth() {
        let mut cfg = ReplayConfig::default();
        cfg.checkpoint_every_events = 0;
        cfg.checkpoint_every_seconds = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ReplayConfig::default();
        cfg.top_depth = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ReplayConfig::default();
        cfg.top_depth = 21;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn out_of_order_policy_parses() {
        assert_eq!(
            "drop".parse::<OutOfOrderPolicy>().unwrap(),
            OutOfOrderPolicy::Drop
        );
        assert_eq!(
            "carry".parse::<OutOfOrderPolicy>().unwrap(),
            OutOfOrderPolicy::Carry
        );
        assert!("keep".parse::<OutOfOrderPolicy>().is_err());
    }
}
