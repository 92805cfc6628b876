//! The event replayer: drives the order-book engine over the unified stream
//! and owns the durability ordering.
//!
//! Per enriched event the commit path is WAL append (buffered) then sink
//! append (buffered); fsync happens at micro-batch boundaries and before
//! every checkpoint. Checkpoints fire every N events or T seconds; the WAL
//! is truncated only up to what both the latest durable checkpoint *and* the
//! manifested sink cover, so un-manifested rows always survive a crash in
//! the log.
//!
//! Recovery hands the replayer two windows over the deterministic merged
//! stream: events before `skip_until_position` were fully covered by the
//! checkpoint and are skipped outright; the next `suppress_events` enriched
//! events were already durable in the WAL (and re-emitted to the sink during
//! recovery), so they are re-applied to advance engine state but neither
//! re-appended nor re-sunk.

use crate::book::{EngineState, OrderBookEngine};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::ReplayConfig;
use crate::error::{Result, RlxError};
use crate::event::UnifiedEvent;
use crate::metrics::{Metrics, sampled};
use crate::sink::Sink;
use crate::wal::Wal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Replay resume windows produced by recovery. A fresh start is all zeros.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumePoint {
    /// Unified events already reflected in the restored engine state.
    pub skip_until_position: u64,
    /// Enriched events already durable in the WAL (re-applied, not re-emitted).
    pub suppress_events: u64,
}

pub struct Replayer {
    cfg: ReplayConfig,
    symbol: String,
    engine: OrderBookEngine,
    wal: Wal,
    sink: Sink,
    checkpoints: CheckpointStore,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,

    position: u64,
    last_arrival_index: u64,
    skip_until_position: u64,
    suppress_remaining: u64,

    emitted_in_batch: usize,
    events_since_checkpoint: u64,
    last_checkpoint_at: Instant,
    interrupted: bool,
}

impl Replayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ReplayConfig,
        symbol: String,
        engine: OrderBookEngine,
        wal: Wal,
        sink: Sink,
        checkpoints: CheckpointStore,
        metrics: Arc<Metrics>,
        shutdown: Arc<AtomicBool>,
        resume: ResumePoint,
    ) -> Self {
        Replayer {
            cfg,
            symbol,
            engine,
            wal,
            sink,
            checkpoints,
            metrics,
            shutdown,
            position: 0,
            last_arrival_index: 0,
            skip_until_position: resume.skip_until_position,
            suppress_remaining: resume.suppress_events,
            emitted_in_batch: 0,
            events_since_checkpoint: 0,
            last_checkpoint_at: Instant::now(),
            interrupted: false,
        }
    }

    /// Whether the run stopped on the shutdown signal rather than input
    /// exhaustion.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// Consume the unified stream to completion (or shutdown), then drain.
    ///
    /// A fatal fault terminates the worker, but only after attempting a
    /// final WAL flush and covering checkpoint so the recoverable window
    /// stays as small as the fault allows.
    pub fn run(&mut self, events: impl Iterator<Item = Result<UnifiedEvent>>) -> Result<()> {
        if let Err(e) = self.pump(events) {
            if self.wal.sync().is_ok() {
                let _ = self.maybe_checkpoint(true);
            }
            return Err(e);
        }
        self.drain()
    }

    fn pump(&mut self, events: impl Iterator<Item = Result<UnifiedEvent>>) -> Result<()> {
        for item in events {
            if self.shutdown.load(Ordering::Relaxed) {
                self.interrupted = true;
                break;
            }
            let event = item?;
            self.position += 1;
            if self.position <= self.skip_until_position {
                continue;
            }
            self.last_arrival_index = event.arrival_index;
            self.step(event)?;
        }
        Ok(())
    }

    fn step(&mut self, event: UnifiedEvent) -> Result<()> {
        let enriched = match self.engine.apply(event) {
            Ok(v) => v,
            Err(RlxError::InitializationOverflow { buffered }) => {
                // Partition-fatal only: the buffered backlog is discarded
                // and the engine waits for the next snapshot.
                warn!(
                    symbol = self.symbol,
                    buffered, "pending queue overflow, waiting for next snapshot"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        for mut ev in enriched {
            if self.suppress_remaining > 0 {
                // Already durable in the WAL and re-emitted by recovery;
                // this pass only advances engine state.
                self.suppress_remaining -= 1;
                continue;
            }
            self.wal.append(&mut ev)?;
            self.sink.append(&ev)?;
            self.emitted_in_batch += 1;
            self.events_since_checkpoint += 1;
        }
        if self.emitted_in_batch >= self.cfg.batch_size {
            self.commit_batch()?;
        }
        self.maybe_checkpoint(false)?;
        Ok(())
    }

    /// Micro-batch boundary: WAL becomes durable, sink buffer drains.
    fn commit_batch(&mut self) -> Result<()> {
        self.wal.sync()?;
        self.sink.flush()?;
        self.emitted_in_batch = 0;
        Ok(())
    }

    fn checkpoint_due(&self) -> bool {
        (self.cfg.checkpoint_every_events > 0
            && self.events_since_checkpoint >= self.cfg.checkpoint_every_events)
            || (self.cfg.checkpoint_every_seconds > 0
                && self.last_checkpoint_at.elapsed().as_secs() >= self.cfg.checkpoint_every_seconds
                && self.events_since_checkpoint > 0)
    }

    fn maybe_checkpoint(&mut self, force: bool) -> Result<()> {
        if !force && !self.checkpoint_due() {
            return Ok(());
        }
        // A checkpoint taken before the first snapshot would lose the
        // pending queue; one taken inside the recovery suppression window
        // would claim WAL coverage the book does not have yet.
        if matches!(self.engine.state(), EngineState::Uninitialized) || self.suppress_remaining > 0
        {
            return Ok(());
        }
        // Durability ordering: WAL fsync strictly before the checkpoint.
        self.commit_batch()?;

        let id = self.checkpoints.next_id()?;
        let checkpoint = Checkpoint {
            id,
            symbol: self.symbol.clone(),
            created_unix_ns: unix_now_ns(),
            book: self.engine.export_state(),
            replay_position: self.position,
            arrival_index: self.last_arrival_index,
            wal_high_water_mark: self.wal.next_seq(),
            sink_high_water_mark: self.sink.high_water_mark(),
        };
        self.checkpoints.write(&checkpoint)?;
        self.checkpoints.prune_older_than(id)?;
        self.sink.set_checkpoint_id(id);

        // Close the covered segment, then truncate only what both the
        // checkpoint and the manifest cover: rows not yet manifested must
        // stay recoverable from the log.
        self.wal.rotate()?;
        let covered = match (
            checkpoint.wal_high_water_mark.checked_sub(1),
            self.sink.manifested_wal_mark(),
        ) {
            (Some(ckpt_last), Some(manifested)) => Some(ckpt_last.min(manifested)),
            _ => None,
        };
        self.wal.truncate_below(id, covered)?;

        self.events_since_checkpoint = 0;
        self.last_checkpoint_at = Instant::now();
        let n = self
            .metrics
            .checkpoints_written
            .load(Ordering::Relaxed);
        if sampled(n) {
            info!(symbol = self.symbol, id, position = self.position, "checkpoint");
        }
        Ok(())
    }

    /// Drain: flush everything, rotate the WAL, emit the final checkpoint.
    fn drain(&mut self) -> Result<()> {
        // Checked before the drain transition erases it: a never-initialized
        // engine has no state worth checkpointing.
        let initialized = !matches!(self.engine.state(), EngineState::Uninitialized);
        self.engine.begin_drain();
        self.commit_batch()?;
        self.sink.close()?;
        if initialized {
            // After sink.close() the manifest covers every emitted row, so
            // the final checkpoint (which also rotates the WAL) truncates
            // the log completely.
            self.maybe_checkpoint(true)?;
        } else {
            self.wal.rotate()?;
        }
        self.engine.close();
        info!(
            symbol = self.symbol,
            events = self.position,
            interrupted = self.interrupted,
            "replay drained"
        );
        Ok(())
    }

    /// Final metrics snapshot accessors for the worker report.
    pub fn position(&self) -> u64 {
        self.position
    }
}

fn unix_now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
