//! Data sink: hourly-partitioned columnar output with an atomically updated
//! per-symbol manifest.
//!
//! Layout under the output root:
//!
//! ```text
//! out/<symbol>/<YYYY>/<MM>/<DD>/<HH>/events-<seq>.rlxc
//! out/<symbol>/manifest
//! ```
//!
//! Every partition follows the same protocol: stream row groups into a temp
//! file in the final directory, fsync the file, fsync the directory, rename,
//! then rewrite the manifest (itself temp + rename + fsync). A partition
//! whose `(time range, sha256)` already appears in the manifest is a
//! recovery re-emission and is discarded, which is what makes the
//! at-least-once output idempotent at partition granularity.

use crate::columnar::{ColumnValues, ColumnarWriter, RowGroup, events_schema};
use crate::config::ReplayConfig;
use crate::error::Result;
use crate::event::{EnrichedEvent, EventPayload, Level};
use crate::metrics::Metrics;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const NANOS_PER_HOUR: i64 = 3_600_000_000_000;

/// One fully manifested partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the symbol directory.
    pub path: String,
    pub rows: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub sha256: String,
    pub wal_high_water_mark: u64,
    pub checkpoint_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub symbol: String,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Manifest> {
        if !path.exists() {
            return Ok(Manifest::default());
        }
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| crate::error::RlxError::Decode {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    fn store(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(&tmp, bytes)?;
        File::open(&tmp)?.sync_all()?;
        std::fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    /// Highest event timestamp covered by any manifested partition.
    pub fn high_water_mark(&self) -> i64 {
        self.entries
            .iter()
            .map(|e| e.max_timestamp)
            .max()
            .unwrap_or(i64::MIN)
    }

    /// Highest WAL sequence covered by any manifested partition, `None`
    /// when nothing is manifested yet.
    pub fn wal_mark(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.wal_high_water_mark).max()
    }

    fn is_duplicate(&self, min_ts: i64, max_ts: i64, sha256: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.min_timestamp == min_ts && e.max_timestamp == max_ts && e.sha256 == sha256)
    }
}

struct OpenPartition {
    hour_start: i64,
    dir: PathBuf,
    tmp_path: PathBuf,
    final_name: String,
    writer: ColumnarWriter,
    buffer: Vec<EnrichedEvent>,
    rows: u64,
    min_ts: i64,
    max_ts: i64,
    max_wal_seq: u64,
}

/// The per-symbol sink. Single-writer: exactly one worker owns it.
pub struct Sink {
    symbol_dir: PathBuf,
    manifest_path: PathBuf,
    manifest: Manifest,
    current: Option<OpenPartition>,
    next_file_seq: u64,
    batch_size: usize,
    checkpoint_id: u64,
    metrics: Arc<Metrics>,
}

impl Sink {
    pub fn open(
        out_root: &Path,
        symbol: &str,
        cfg: &ReplayConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let symbol_dir = out_root.join(symbol);
        std::fs::create_dir_all(&symbol_dir)?;
        let manifest_path = symbol_dir.join("manifest");
        let mut manifest = Manifest::load(&manifest_path)?;
        if manifest.symbol.is_empty() {
            manifest.symbol = symbol.to_string();
        }
        let next_file_seq = manifest
            .entries
            .iter()
            .filter_map(|e| {
                Path::new(&e.path)
                    .file_stem()?
                    .to_str()?
                    .strip_prefix("events-")?
                    .parse::<u64>()
                    .ok()
            })
            .max()
            .map(|s| s + 1)
            .unwrap_or(0);
        Ok(Sink {
            symbol_dir,
            manifest_path,
            manifest,
            current: None,
            next_file_seq,
            batch_size: cfg.batch_size,
            checkpoint_id: 0,
            metrics,
        })
    }

    pub fn symbol_dir(&self) -> &Path {
        &self.symbol_dir
    }

    /// Highest event timestamp known durable (manifested).
    pub fn high_water_mark(&self) -> i64 {
        self.manifest.high_water_mark()
    }

    /// Highest WAL sequence durable in a manifested partition. WAL records
    /// above this mark must survive truncation: recovery re-emits them.
    pub fn manifested_wal_mark(&self) -> Option<u64> {
        self.manifest.wal_mark()
    }

    /// Checkpoint id recorded on subsequently closed partitions.
    pub fn set_checkpoint_id(&mut self, id: u64) {
        self.checkpoint_id = id;
    }

    /// Append one enriched event; rolls the partition at hour boundaries.
    pub fn append(&mut self, event: &EnrichedEvent) -> Result<()> {
        let ts = event.event_timestamp();
        let hour_start = ts.div_euclid(NANOS_PER_HOUR) * NANOS_PER_HOUR;
        let rolls = self
            .current
            .as_ref()
            .is_some_and(|p| p.hour_start != hour_start);
        if rolls {
            self.finalize_current()?;
        }
        if self.current.is_none() {
            self.open_partition(hour_start)?;
        }
        let part = self.current.as_mut().expect("partition open");
        part.min_ts = part.min_ts.min(ts);
        part.max_ts = part.max_ts.max(ts);
        part.max_wal_seq = part.max_wal_seq.max(event.wal_seq);
        part.buffer.push(event.clone());
        if part.buffer.len() >= self.batch_size {
            Self::drain_buffer(part)?;
        }
        Ok(())
    }

    /// Push buffered rows into the temp file (no partition close).
    pub fn flush(&mut self) -> Result<()> {
        if let Some(part) = self.current.as_mut() {
            Self::drain_buffer(part)?;
        }
        Ok(())
    }

    /// Finalize the in-flight partition (if any) and stop.
    pub fn close(&mut self) -> Result<()> {
        self.finalize_current()
    }

    fn open_partition(&mut self, hour_start: i64) -> Result<()> {
        let dir = self.symbol_dir.join(hour_dir_path(hour_start)?);
        std::fs::create_dir_all(&dir)?;
        let final_name = format!("events-{:05}.{}", self.next_file_seq, crate::columnar::FILE_EXT);
        self.next_file_seq += 1;
        let tmp_path = dir.join(format!("{final_name}.tmp"));
        let writer = ColumnarWriter::create(&tmp_path, events_schema())?;
        debug!(path = %tmp_path.display(), "partition opened");
        self.current = Some(OpenPartition {
            hour_start,
            dir,
            tmp_path,
            final_name,
            writer,
            buffer: Vec::with_capacity(self.batch_size),
            rows: 0,
            min_ts: i64::MAX,
            max_ts: i64::MIN,
            max_wal_seq: 0,
        });
        Ok(())
    }

    fn drain_buffer(part: &mut OpenPartition) -> Result<()> {
        if part.buffer.is_empty() {
            return Ok(());
        }
        let group = encode_rows(&part.buffer);
        part.rows += group.rows() as u64;
        part.writer.write_group(&group)?;
        part.buffer.clear();
        Ok(())
    }

    fn finalize_current(&mut self) -> Result<()> {
        let Some(mut part) = self.current.take() else {
            return Ok(());
        };
        Self::drain_buffer(&mut part)?;
        if part.rows == 0 {
            std::fs::remove_file(&part.tmp_path).ok();
            return Ok(());
        }
        part.writer.sync()?;
        File::open(&part.dir)?.sync_all()?;

        let sha256 = sha256_file(&part.tmp_path)?;
        if self.manifest.is_duplicate(part.min_ts, part.max_ts, &sha256) {
            // Re-emitted during recovery: identical partition already
            // manifested.
            std::fs::remove_file(&part.tmp_path)?;
            Metrics::bump(&self.metrics.partitions_deduplicated);
            warn!(name = part.final_name, "duplicate partition discarded");
            return Ok(());
        }

        let final_path = part.dir.join(&part.final_name);
        std::fs::rename(&part.tmp_path, &final_path)?;
        File::open(&part.dir)?.sync_all()?;

        let rel = final_path
            .strip_prefix(&self.symbol_dir)
            .unwrap_or(&final_path)
            .to_string_lossy()
            .into_owned();
        let bytes = std::fs::metadata(&final_path)?.len();
        self.manifest.entries.push(ManifestEntry {
            path: rel,
            rows: part.rows,
            min_timestamp: part.min_ts,
            max_timestamp: part.max_ts,
            sha256,
            wal_high_water_mark: part.max_wal_seq,
            checkpoint_id: self.checkpoint_id,
        });
        self.manifest.store(&self.manifest_path)?;
        Metrics::bump(&self.metrics.partitions_written);
        Metrics::add(&self.metrics.rows_written, part.rows);
        Metrics::add(&self.metrics.sink_bytes, bytes);
        info!(
            partition = part.final_name,
            rows = part.rows,
            bytes,
            "partition manifested"
        );
        Ok(())
    }
}

/// Delete stray `*.tmp` partition files left by a crash.
pub fn remove_orphan_temps(symbol_dir: &Path) -> Result<usize> {
    fn walk(dir: &Path, removed: &mut usize) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, removed)?;
            } else if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                std::fs::remove_file(&path)?;
                *removed += 1;
            }
        }
        Ok(())
    }
    let mut removed = 0;
    if symbol_dir.exists() {
        walk(symbol_dir, &mut removed)?;
    }
    if removed > 0 {
        info!(removed, "orphan partition temp files removed");
    }
    Ok(removed)
}

fn hour_dir_path(hour_start_ns: i64) -> Result<PathBuf> {
    let dt = time::OffsetDateTime::from_unix_timestamp_nanos(hour_start_ns as i128)
        .map_err(|e| crate::error::RlxError::Config(e.to_string()))?;
    Ok(PathBuf::from(format!(
        "{:04}/{:02}/{:02}/{:02}",
        dt.year(),
        u8::from(dt.month()),
        dt.day(),
        dt.hour()
    )))
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

fn levels_to_pairs(levels: &[Level]) -> Vec<(i128, i128)> {
    levels
        .iter()
        .map(|l| (l.price.raw(), l.size.raw()))
        .collect()
}

/// Encode enriched events into one row group matching
/// [`events_schema`].
pub fn encode_rows(events: &[EnrichedEvent]) -> RowGroup {
    let n = events.len();
    let mut event_timestamp = Vec::with_capacity(n);
    let mut event_type = Vec::with_capacity(n);
    let mut update_id = Vec::with_capacity(n);
    let mut trade_price = Vec::with_capacity(n);
    let mut trade_quantity = Vec::with_capacity(n);
    let mut trade_side = Vec::with_capacity(n);
    let mut trade_id = Vec::with_capacity(n);
    let mut delta_side = Vec::with_capacity(n);
    let mut delta_price = Vec::with_capacity(n);
    let mut delta_quantity = Vec::with_capacity(n);
    let mut snapshot_bids = Vec::with_capacity(n);
    let mut snapshot_asks = Vec::with_capacity(n);
    let mut bid_state = Vec::with_capacity(n);
    let mut ask_state = Vec::with_capacity(n);

    for ev in events {
        event_timestamp.push(ev.event_timestamp());
        event_type.push(ev.event.event_type().as_u8());
        update_id.push(ev.event.update_id());
        match &ev.event.payload {
            EventPayload::Trade(t) => {
                trade_price.push(Some(t.price.raw()));
                trade_quantity.push(Some(t.quantity.raw()));
                trade_side.push(Some(t.side.as_u8()));
                trade_id.push(t.trade_id);
                delta_side.push(None);
                delta_price.push(None);
                delta_quantity.push(None);
                snapshot_bids.push(Vec::new());
                snapshot_asks.push(Vec::new());
            }
            EventPayload::Delta(d) => {
                trade_price.push(None);
                trade_quantity.push(None);
                trade_side.push(None);
                trade_id.push(None);
                delta_side.push(Some(d.side.as_u8()));
                delta_price.push(Some(d.price.raw()));
                delta_quantity.push(Some(d.new_quantity.raw()));
                snapshot_bids.push(Vec::new());
                snapshot_asks.push(Vec::new());
            }
            EventPayload::Snapshot(s) => {
                trade_price.push(None);
                trade_quantity.push(None);
                trade_side.push(None);
                trade_id.push(None);
                delta_side.push(None);
                delta_price.push(None);
                delta_quantity.push(None);
                snapshot_bids.push(levels_to_pairs(&s.bids));
                snapshot_asks.push(levels_to_pairs(&s.asks));
            }
        }
        bid_state.push(levels_to_pairs(&ev.bids));
        ask_state.push(levels_to_pairs(&ev.asks));
    }

    RowGroup {
        columns: vec![
            ColumnValues::I64(event_timestamp),
            ColumnValues::U8(event_type),
            ColumnValues::OptI64(update_id),
            ColumnValues::OptDecimal(trade_price),
            ColumnValues::OptDecimal(trade_quantity),
            ColumnValues::OptU8(trade_side),
            ColumnValues::OptI64(trade_id),
            ColumnValues::OptU8(delta_side),
            ColumnValues::OptDecimal(delta_price),
            ColumnValues::OptDecimal(delta_quantity),
            ColumnValues::LevelList(snapshot_bids),
            ColumnValues::LevelList(snapshot_asks),
            ColumnValues::LevelList(bid_state),
            ColumnValues::LevelList(ask_state),
        ],
    }
}
