//! Durable engine checkpoints.
//!
//! A checkpoint is a single file `checkpoints/checkpoint-<id:020>` holding
//! one CRC-framed bincode payload: the full book state (both sides including
//! overflow), the replay position, and the WAL / sink high-water marks.
//! Files are written to a temp name, fsynced, renamed into place and the
//! directory fsynced, so a crash never leaves a half-written checkpoint
//! under the final name. A checksum mismatch on load is
//! [`RlxError::CorruptCheckpoint`]: fatal, operator intervention required.

use crate::book::BookState;
use crate::columnar::{Frame, read_frame, write_frame};
use crate::error::{Result, RlxError};
use crate::metrics::Metrics;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Everything needed to resume a worker without replaying history from the
/// beginning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: u64,
    pub symbol: String,
    pub created_unix_ns: i64,
    /// Copy-on-write snapshot of the engine.
    pub book: BookState,
    /// Unified events consumed from the (deterministic) merged stream.
    pub replay_position: u64,
    /// Arrival index of the last applied event.
    pub arrival_index: u64,
    /// Next WAL sequence number at checkpoint time; every lower sequence is
    /// reflected in `book`.
    pub wal_high_water_mark: u64,
    /// Highest `event_timestamp` covered by a fully manifested partition.
    pub sink_high_water_mark: i64,
}

fn checkpoint_file_name(id: u64) -> String {
    format!("checkpoint-{id:020}")
}

fn parse_checkpoint_id(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("checkpoint-")?
        .parse()
        .ok()
}

/// Owns the checkpoint directory of one symbol.
pub struct CheckpointStore {
    dir: PathBuf,
    metrics: Arc<Metrics>,
}

impl CheckpointStore {
    pub fn open(dir: &Path, metrics: Arc<Metrics>) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(CheckpointStore {
            dir: dir.to_path_buf(),
            metrics,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn list(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some() {
                continue; // temp files
            }
            if let Some(id) = parse_checkpoint_id(&path) {
                out.push((id, path));
            }
        }
        out.sort_by_key(|(id, _)| *id);
        Ok(out)
    }

    pub fn next_id(&self) -> Result<u64> {
        Ok(self.list()?.last().map(|(id, _)| id + 1).unwrap_or(1))
    }

    /// Write `checkpoint` durably: temp file, fsync, rename, directory
    /// fsync.
    pub fn write(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let start = Instant::now();
        let path = self.dir.join(checkpoint_file_name(checkpoint.id));
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            let payload = bincode::serialize(checkpoint).map_err(std::io::Error::other)?;
            write_frame(&mut file, &payload)?;
            file.flush()?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        File::open(&self.dir)?.sync_all()?;
        Metrics::bump(&self.metrics.checkpoints_written);
        Metrics::set(
            &self.metrics.checkpoint_nanos_last,
            start.elapsed().as_nanos() as u64,
        );
        debug!(
            id = checkpoint.id,
            wal_hwm = checkpoint.wal_high_water_mark,
            position = checkpoint.replay_position,
            "checkpoint written"
        );
        Ok(path)
    }

    /// Load the newest checkpoint, if any. A checksum or framing failure is
    /// fatal rather than silently skipped: restarting from an older
    /// checkpoint would silently shrink the recoverable window.
    pub fn load_latest(&self) -> Result<Option<Checkpoint>> {
        let Some((_, path)) = self.list()?.into_iter().next_back() else {
            return Ok(None);
        };
        let checkpoint = read_checkpoint(&path)?;
        Ok(Some(checkpoint))
    }

    /// Remove checkpoints older than `durable_id` (the newest durable one).
    pub fn prune_older_than(&self, durable_id: u64) -> Result<()> {
        let mut removed = 0usize;
        for (id, path) in self.list()? {
            if id < durable_id {
                std::fs::remove_file(path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            File::open(&self.dir)?.sync_all()?;
            info!(removed, keep = durable_id, "old checkpoints pruned");
        }
        Ok(())
    }

    /// Remove leftover temp files from an interrupted write.
    pub fn remove_orphan_temps(&self) -> Result<usize> {
        let mut removed = 0usize;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                std::fs::remove_file(path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let mut r = BufReader::new(File::open(path)?);
    match read_frame(&mut r)? {
        Frame::Payload(payload) => {
            bincode::deserialize(&payload).map_err(|e| RlxError::CorruptCheckpoint {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })
        }
        Frame::Corrupt { stored, computed } => Err(RlxError::CorruptCheckpoint {
            path: path.to_path_buf(),
            detail: format!("crc mismatch {stored:#x} != {computed:#x}"),
        }),
        Frame::Eof | Frame::Truncated => Err(RlxError::CorruptCheckpoint {
            path: path.to_path_buf(),
            detail: "incomplete checkpoint frame".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::OrderBookEngine;
    use crate::config::ReplayConfig;
    use crate::decimal::Decimal;
    use crate::event::{EventPayload, Level, SnapshotRecord, UnifiedEvent};

    fn sample_checkpoint(id: u64) -> Checkpoint {
        let metrics = Arc::new(Metrics::new());
        let mut eng = OrderBookEngine::new(&ReplayConfig::default(), metrics);
        eng.apply(UnifiedEvent {
            arrival_index: 0,
            payload: EventPayload::Snapshot(SnapshotRecord {
                origin_time: 1,
                bids: vec![Level::new(Decimal::from_int(100), Decimal::from_int(1))],
                asks: vec![Level::new(Decimal::from_int(101), Decimal::from_int(2))],
            }),
        })
        .unwrap();
        Checkpoint {
            id,
            symbol: "BTCUSDT".into(),
            created_unix_ns: 0,
            book: eng.export_state(),
            replay_position: 1,
            arrival_index: 0,
            wal_high_water_mark: 1,
            sink_high_water_mark: i64::MIN,
        }
    }

    fn store(dir: &Path) -> CheckpointStore {
        CheckpointStore::open(dir, Arc::new(Metrics::new())).unwrap()
    }

    #[test]
    fn write_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(s.load_latest().unwrap().is_none());
        let cp = sample_checkpoint(1);
        s.write(&cp).unwrap();
        assert_eq!(s.load_latest().unwrap(), Some(cp));
        assert_eq!(s.next_id().unwrap(), 2);
    }

    #[test]
    fn newest_checkpoint_wins_and_pruning_keeps_it() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        for id in 1..=3 {
            s.write(&sample_checkpoint(id)).unwrap();
        }
        assert_eq!(s.load_latest().unwrap().unwrap().id, 3);
        s.prune_older_than(3).unwrap();
        assert_eq!(s.list().unwrap().len(), 1);
        assert_eq!(s.load_latest().unwrap().unwrap().id, 3);
    }

    #[test]
    fn corrupt_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let path = s.write(&sample_checkpoint(1)).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            s.load_latest(),
            Err(RlxError::CorruptCheckpoint { .. })
        ));
    }

    #[test]
    fn orphan_temps_are_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        std::fs::write(dir.path().join("checkpoint-1.tmp"), b"partial").unwrap();
        assert_eq!(s.remove_orphan_temps().unwrap(), 1);
        assert!(s.load_latest().unwrap().is_none());
    }
}
