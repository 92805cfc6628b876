//! Counters, rollups and the run summary.
//!
//! Steady-state observability is counter-based: hot paths bump atomics and
//! the supervisor periodically serializes a [`MetricsSnapshot`] to
//! `out/metrics.json`. Warnings use a count-and-sample discipline
//! ([`sampled`]) so a pathological input cannot turn the log into a firehose.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Log the first few occurrences of a condition, then every 1000th.
pub fn sampled(occurrence: u64) -> bool {
    occurrence <= 10 || occurrence.is_multiple_of(1000)
}

#[derive(Debug, Default)]
struct DriftStats {
    count: u64,
    sum: f64,
    sum_sq: f64,
    max: f64,
}

/// Shared per-worker (and aggregated per-run) metrics registry.
#[derive(Debug, Default)]
pub struct Metrics {
    pub events_applied: AtomicU64,
    pub trades_applied: AtomicU64,
    pub deltas_applied: AtomicU64,
    pub snapshots_applied: AtomicU64,

    pub out_of_order: AtomicU64,
    pub duplicate_delta: AtomicU64,
    pub gap_detected: AtomicU64,
    pub gap_updates_skipped: AtomicU64,
    pub crossed_levels_removed: AtomicU64,
    pub resyncs_after_gap: AtomicU64,
    pub high_drift: AtomicU64,
    pub hidden_liquidity_events: AtomicU64,
    pub init_overflows: AtomicU64,
    pub decode_errors: AtomicU64,
    pub schema_errors: AtomicU64,
    pub io_retries: AtomicU64,

    pub wal_appends: AtomicU64,
    pub wal_fsyncs: AtomicU64,
    pub wal_fsync_nanos: AtomicU64,
    pub wal_bytes: AtomicU64,
    pub checkpoints_written: AtomicU64,
    pub checkpoint_nanos_last: AtomicU64,
    pub recovery_nanos: AtomicU64,
    pub recovered_events: AtomicU64,

    pub partitions_written: AtomicU64,
    pub partitions_deduplicated: AtomicU64,
    pub rows_written: AtomicU64,
    pub sink_bytes: AtomicU64,

    pub pending_queue_depth: AtomicU64,

    drift: Mutex<DriftStats>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add(counter: &AtomicU64, v: u64) {
        counter.fetch_add(v, Ordering::Relaxed);
    }

    pub fn set(counter: &AtomicU64, v: u64) {
        counter.store(v, Ordering::Relaxed);
    }

    pub fn record_drift(&self, relative_rms: f64) {
        let mut d = self.drift.lock().expect("drift stats poisoned");
        d.count += 1;
        d.sum += relative_rms;
        d.sum_sq += relative_rms * relative_rms;
        if relative_rms > d.max {
            d.max = relative_rms;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let drift = self.drift.lock().expect("drift stats poisoned");
        MetricsSnapshot {
            events_applied: get(&self.events_applied),
            trades_applied: get(&self.trades_applied),
            deltas_applied: get(&self.deltas_applied),
            snapshots_applied: get(&self.snapshots_applied),
            out_of_order: get(&self.out_of_order),
            duplicate_delta: get(&self.duplicate_delta),
            gap_detected: get(&self.gap_detected),
            gap_updates_skipped: get(&self.gap_updates_skipped),
            crossed_levels_removed: get(&self.crossed_levels_removed),
            resyncs_after_gap: get(&self.resyncs_after_gap),
            high_drift: get(&self.high_drift),
            hidden_liquidity_events: get(&self.hidden_liquidity_events),
            init_overflows: get(&self.init_overflows),
            decode_errors: get(&self.decode_errors),
            schema_errors: get(&self.schema_errors),
            io_retries: get(&self.io_retries),
            wal_appends: get(&self.wal_appends),
            wal_fsyncs: get(&self.wal_fsyncs),
            wal_fsync_nanos: get(&self.wal_fsync_nanos),
            wal_bytes: get(&self.wal_bytes),
            checkpoints_written: get(&self.checkpoints_written),
            checkpoint_nanos_last: get(&self.checkpoint_nanos_last),
            recovery_nanos: get(&self.recovery_nanos),
            recovered_events: get(&self.recovered_events),
            partitions_written: get(&self.partitions_written),
            partitions_deduplicated: get(&self.partitions_deduplicated),
            rows_written: get(&self.rows_written),
            sink_bytes: get(&self.sink_bytes),
            pending_queue_depth: get(&self.pending_queue_depth),
            drift_count: drift.count,
            drift_mean: if drift.count > 0 {
                drift.sum / drift.count as f64
            } else {
                0.0
            },
            drift_rms: if drift.count > 0 {
                (drift.sum_sq / drift.count as f64).sqrt()
            } else {
                0.0
            },
            drift_max: drift.max,
        }
    }

    /// Serialize the current snapshot to the metrics file endpoint
    /// (tmp + rename, so readers never observe a half-written file).
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let snap = self.snapshot();
        let json = serde_json::to_vec_pretty(&snap).map_err(std::io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Point-in-time copy of every counter; also the run-summary payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_applied: u64,
    pub trades_applied: u64,
    pub deltas_applied: u64,
    pub snapshots_applied: u64,
    pub out_of_order: u64,
    pub duplicate_delta: u64,
    pub gap_detected: u64,
    pub gap_updates_skipped: u64,
    pub crossed_levels_removed: u64,
    pub resyncs_after_gap: u64,
    pub high_drift: u64,
    pub hidden_liquidity_events: u64,
    pub init_overflows: u64,
    pub decode_errors: u64,
    pub schema_errors: u64,
    pub io_retries: u64,
    pub wal_appends: u64,
    pub wal_fsyncs: u64,
    pub wal_fsync_nanos: u64,
    pub wal_bytes: u64,
    pub checkpoints_written: u64,
    pub checkpoint_nanos_last: u64,
    pub recovery_nanos: u64,
    pub recovered_events: u64,
    pub partitions_written: u64,
    pub partitions_deduplicated: u64,
    pub rows_written: u64,
    pub sink_bytes: u64,
    pub pending_queue_depth: u64,
    pub drift_count: u64,
    pub drift_mean: f64,
    pub drift_rms: f64,
    pub drift_max: f64,
}

impl MetricsSnapshot {
    /// End-of-run summary, one line per reporting bucket.
    pub fn summary_lines(&self) -> Vec<String> {
        vec![
            format!(
                "events: {} applied ({} trades, {} deltas, {} snapshots)",
                self.events_applied, self.trades_applied, self.deltas_applied,
                self.snapshots_applied
            ),
            format!(
                "output: {} partitions, {} rows, {} bytes ({} duplicates discarded)",
                self.partitions_written, self.rows_written, self.sink_bytes,
                self.partitions_deduplicated
            ),
            format!(
                "quality: {} out-of-order, {} duplicate deltas, {} gaps ({} updates wide), {} high-drift snapshots, {} crossed levels removed",
                self.out_of_order,
                self.duplicate_delta,
                self.gap_detected,
                self.gap_updates_skipped,
                self.high_drift,
                self.crossed_levels_removed
            ),
            format!(
                "drift: {} samples, mean {:.3e}, rms {:.3e}, max {:.3e}",
                self.drift_count, self.drift_mean, self.drift_rms, self.drift_max
            ),
            format!(
                "durability: {} WAL appends / {} fsyncs, {} checkpoints, recovery replayed {} events",
                self.wal_appends, self.wal_fsyncs, self.checkpoints_written,
                self.recovered_events
            ),
        ]
    }
}
