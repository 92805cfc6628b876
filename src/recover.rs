//! Crash recovery.
//!
//! On worker start:
//! 1. Load the newest valid checkpoint (checksum-verified; corruption is
//!    fatal) and restore engine state + positions from it.
//! 2. Delete orphan sink and checkpoint temp files.
//! 3. Scan the WAL; every record not yet covered by a manifested partition
//!    is re-emitted to the sink. Engine state is *not* rebuilt from the WAL:
//!    the checkpoint already holds it, and records past the checkpoint are
//!    regenerated deterministically when input re-processing passes through
//!    them (suppressed from re-emission by the replayer's resume windows).
//! 4. Resume normal processing from the checkpoint's replay position.
//!
//! Output stays at-least-once; partition-level `(time range, sha256)` dedup
//! in the sink discards overlap.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::ReplayConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::replay::ResumePoint;
use crate::sink::{self, Sink};
use crate::wal::WalReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Everything a worker needs to resume after [`recover_worker`].
#[derive(Debug)]
pub struct Recovery {
    pub resume: ResumePoint,
    /// Sequence the reopened WAL continues from.
    pub next_wal_seq: u64,
    pub last_checkpoint_id: u64,
    pub checkpoint: Option<Checkpoint>,
    /// WAL records re-emitted to the sink.
    pub reemitted: u64,
}

/// Run the recovery procedure for one symbol. `sink` must be freshly opened
/// (manifest loaded); re-emitted rows are flushed into it but the in-flight
/// partition is left open for the resumed replay to continue.
pub fn recover_worker(
    symbol_dir: &Path,
    metrics: &Arc<Metrics>,
    sink: &mut Sink,
) -> Result<Recovery> {
    let start = Instant::now();

    let checkpoints = CheckpointStore::open(&symbol_dir.join("checkpoints"), metrics.clone())?;
    checkpoints.remove_orphan_temps()?;
    let checkpoint = checkpoints.load_latest()?;
    sink::remove_orphan_temps(symbol_dir)?;

    let ckpt_wal_hwm = checkpoint
        .as_ref()
        .map(|c| c.wal_high_water_mark)
        .unwrap_or(0);
    let manifested = sink.manifested_wal_mark();

    let mut suppress = 0u64;
    let mut reemitted = 0u64;
    let mut tip: Option<u64> = None;
    for record in WalReader::open(&symbol_dir.join("wal"))? {
        let record = record?;
        tip = Some(record.wal_seq);
        if record.wal_seq >= ckpt_wal_hwm {
            // Will be regenerated by deterministic re-processing.
            suppress += 1;
        }
        if manifested.is_none_or(|m| record.wal_seq > m) {
            sink.append(&record)?;
            reemitted += 1;
        }
    }
    sink.flush()?;

    let next_wal_seq = tip.map(|t| t + 1).unwrap_or(ckpt_wal_hwm);
    let resume = ResumePoint {
        skip_until_position: checkpoint.as_ref().map(|c| c.replay_position).unwrap_or(0),
        suppress_events: suppress,
    };

    Metrics::set(&metrics.recovery_nanos, start.elapsed().as_nanos() as u64);
    Metrics::add(&metrics.recovered_events, reemitted);
    if checkpoint.is_some() || reemitted > 0 {
        info!(
            checkpoint = checkpoint.as_ref().map(|c| c.id),
            reemitted,
            suppress,
            skip = resume.skip_until_position,
            "recovery complete"
        );
    }
    Ok(Recovery {
        resume,
        next_wal_seq,
        last_checkpoint_id: checkpoint.as_ref().map(|c| c.id).unwrap_or(0),
        checkpoint,
        reemitted,
    })
}

/// `recover` CLI: finalize a symbol's on-disk state without consuming new
/// input. Re-emits any WAL backlog, manifests it, writes a covering
/// checkpoint and truncates the WAL.
pub fn finalize_symbol(
    out_root: &Path,
    symbol: &str,
    cfg: &ReplayConfig,
    metrics: &Arc<Metrics>,
) -> Result<()> {
    let symbol_dir = out_root.join(symbol);
    let mut sink = Sink::open(out_root, symbol, cfg, metrics.clone())?;
    let recovery = recover_worker(&symbol_dir, metrics, &mut sink)?;
    sink.close()?;

    let Some(previous) = recovery.checkpoint else {
        info!(symbol, "nothing to finalize: no checkpoint");
        return Ok(());
    };
    let checkpoints = CheckpointStore::open(&symbol_dir.join("checkpoints"), metrics.clone())?;
    let id = checkpoints.next_id()?;
    let checkpoint = Checkpoint {
        id,
        created_unix_ns: unix_now_ns(),
        wal_high_water_mark: recovery.next_wal_seq,
        sink_high_water_mark: sink.high_water_mark(),
        ..previous
    };
    checkpoints.write(&checkpoint)?;
    checkpoints.prune_older_than(id)?;

    let mut wal = crate::wal::Wal::open(
        &symbol_dir.join("wal"),
        symbol,
        cfg,
        metrics.clone(),
        recovery.next_wal_seq,
        id,
    )?;
    let covered = match (
        recovery.next_wal_seq.checked_sub(1),
        sink.manifested_wal_mark(),
    ) {
        (Some(tail), Some(manifested)) => Some(tail.min(manifested)),
        _ => None,
    };
    wal.truncate_below(id, covered)?;
    wal.sync()?;
    info!(symbol, checkpoint = id, "WAL finalized");
    Ok(())
}

fn unix_now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
