//! Write-ahead log: append-only segment files of enriched events.
//!
//! Segments live under `out/<symbol>/wal/` and are named
//! `segment-<id:020>`. Each file starts with a [`SegmentHeader`] frame and
//! continues with one frame per enriched event, in emission order, using the
//! `[len:u32][crc32:u32][bincode payload]` framing shared with the columnar
//! container. A torn tail on the *last* segment is expected after a crash
//! and is silently cut at the last valid frame; corruption anywhere else is
//! [`RlxError::CorruptWal`].
//!
//! Appends are buffered; [`Wal::sync`] flushes and fsyncs (the replayer
//! calls it at micro-batch boundaries and before checkpoints). Segments
//! rotate by size and may be truncated away once a durable checkpoint covers
//! their last sequence number.

use crate::columnar::{Frame, read_frame, write_frame};
use crate::config::ReplayConfig;
use crate::error::{Result, RlxError};
use crate::event::EnrichedEvent;
use crate::metrics::Metrics;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// First frame of every segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub symbol: String,
    pub start_timestamp: i64,
    pub last_checkpoint_id: u64,
    /// Sequence number the first event frame of this segment will carry.
    pub start_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WalFrame {
    Header(SegmentHeader),
    Event(EnrichedEvent),
}

fn segment_file_name(id: u64) -> String {
    format!("segment-{id:020}")
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("segment-")?
        .parse()
        .ok()
}

/// Sorted list of segment files in a WAL directory.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(id) = parse_segment_id(&path) {
            out.push((id, path));
        }
    }
    out.sort_by_key(|(id, _)| *id);
    Ok(out)
}

fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// The append side of the WAL.
pub struct Wal {
    dir: PathBuf,
    symbol: String,
    writer: BufWriter<File>,
    segment_id: u64,
    bytes_in_segment: u64,
    segment_bytes_limit: u64,
    next_seq: u64,
    last_checkpoint_id: u64,
    metrics: Arc<Metrics>,
}

impl Wal {
    /// Start a fresh segment for appending. Existing segments are left in
    /// place (recovery reads them; checkpointing truncates them).
    pub fn open(
        dir: &Path,
        symbol: &str,
        cfg: &ReplayConfig,
        metrics: Arc<Metrics>,
        next_seq: u64,
        last_checkpoint_id: u64,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let segment_id = list_segments(dir)?
            .last()
            .map(|(id, _)| id + 1)
            .unwrap_or(0);
        let writer = new_segment_file(dir, segment_id)?;
        let mut wal = Wal {
            dir: dir.to_path_buf(),
            symbol: symbol.to_string(),
            writer,
            segment_id,
            bytes_in_segment: 0,
            segment_bytes_limit: cfg.wal_segment_bytes,
            next_seq,
            last_checkpoint_id,
            metrics,
        };
        wal.write_header()?;
        Ok(wal)
    }

    fn write_header(&mut self) -> Result<()> {
        let header = WalFrame::Header(SegmentHeader {
            symbol: self.symbol.clone(),
            start_timestamp: now_unix_ns(),
            last_checkpoint_id: self.last_checkpoint_id,
            start_seq: self.next_seq,
        });
        self.write_wal_frame(&header)?;
        self.writer.flush()?;
        fsync_dir(&self.dir)?;
        debug!(
            segment = self.segment_id,
            start_seq = self.next_seq,
            "WAL segment started"
        );
        Ok(())
    }

    fn write_wal_frame(&mut self, frame: &WalFrame) -> Result<u64> {
        let payload = bincode::serialize(frame).map_err(std::io::Error::other)?;
        write_frame(&mut self.writer, &payload)?;
        let framed = payload.len() as u64 + 8;
        self.bytes_in_segment += framed;
        Ok(framed)
    }

    /// Sequence number the next appended event will carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Highest sequence number already appended (`None` before the first).
    pub fn high_water_mark(&self) -> Option<u64> {
        self.next_seq.checked_sub(1).filter(|_| self.next_seq > 0)
    }

    pub fn last_checkpoint_id(&self) -> u64 {
        self.last_checkpoint_id
    }

    /// Append one enriched event; assigns and returns its sequence number.
    /// Buffered: not durable until [`Wal::sync`].
    pub fn append(&mut self, event: &mut EnrichedEvent) -> Result<u64> {
        let seq = self.next_seq;
        event.wal_seq = seq;
        let framed = self.write_wal_frame(&WalFrame::Event(event.clone()))?;
        self.next_seq += 1;
        Metrics::bump(&self.metrics.wal_appends);
        Metrics::add(&self.metrics.wal_bytes, framed);
        if self.bytes_in_segment >= self.segment_bytes_limit {
            self.rotate()?;
        }
        Ok(seq)
    }

    /// Flush buffered frames and fsync the segment file.
    pub fn sync(&mut self) -> Result<()> {
        let start = Instant::now();
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Metrics::bump(&self.metrics.wal_fsyncs);
        Metrics::add(
            &self.metrics.wal_fsync_nanos,
            start.elapsed().as_nanos() as u64,
        );
        Ok(())
    }

    /// Close the current segment and begin the next one.
    pub fn rotate(&mut self) -> Result<()> {
        self.sync()?;
        self.segment_id += 1;
        self.writer = new_segment_file(&self.dir, self.segment_id)?;
        self.bytes_in_segment = 0;
        self.write_header()?;
        Ok(())
    }

    /// Record that checkpoint `id` is durable and covers everything up to
    /// and including `covered_seq`; segments whose last event is at or below
    /// that mark are deleted. `None` records the checkpoint without
    /// deleting anything.
    pub fn truncate_below(&mut self, checkpoint_id: u64, covered_seq: Option<u64>) -> Result<()> {
        self.last_checkpoint_id = checkpoint_id;
        let Some(covered_seq) = covered_seq else {
            return Ok(());
        };
        let segments = list_segments(&self.dir)?;
        let mut removed = 0usize;
        for window in segments.windows(2) {
            let (id, ref path) = window[0];
            if id == self.segment_id {
                continue;
            }
            // The next segment's first seq bounds this segment's last seq.
            let next_start = read_segment_header(&window[1].1)?.start_seq;
            if next_start == 0 || next_start - 1 > covered_seq {
                continue;
            }
            std::fs::remove_file(path)?;
            removed += 1;
        }
        if removed > 0 {
            fsync_dir(&self.dir)?;
            info!(removed, covered_seq, "WAL segments truncated below checkpoint");
        }
        Ok(())
    }
}

fn new_segment_file(dir: &Path, id: u64) -> Result<BufWriter<File>> {
    let path = dir.join(segment_file_name(id));
    let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
    Ok(BufWriter::with_capacity(1 << 20, file))
}

fn now_unix_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

fn read_segment_header(path: &Path) -> Result<SegmentHeader> {
    let mut r = BufReader::new(File::open(path)?);
    match read_frame(&mut r)? {
        Frame::Payload(payload) => match bincode::deserialize::<WalFrame>(&payload) {
            Ok(WalFrame::Header(h)) => Ok(h),
            Ok(_) => Err(RlxError::CorruptWal {
                path: path.to_path_buf(),
                detail: "first frame is not a segment header".into(),
            }),
            Err(e) => Err(RlxError::CorruptWal {
                path: path.to_path_buf(),
                detail: e.to_string(),
            }),
        },
        Frame::Eof | Frame::Truncated => Err(RlxError::CorruptWal {
            path: path.to_path_buf(),
            detail: "segment has no header frame".into(),
        }),
        Frame::Corrupt { stored, computed } => Err(RlxError::CorruptWal {
            path: path.to_path_buf(),
            detail: format!("header crc mismatch {stored:#x} != {computed:#x}"),
        }),
    }
}

/// Streaming reader over every event frame in a WAL directory, in sequence
/// order. Tolerates a torn tail on the final segment only.
pub struct WalReader {
    segments: Vec<PathBuf>,
    index: usize,
    current: Option<BufReader<File>>,
    finished: bool,
}

impl WalReader {
    pub fn open(dir: &Path) -> Result<Self> {
        let segments = list_segments(dir)?
            .into_iter()
            .map(|(_, p)| p)
            .collect::<Vec<_>>();
        Ok(WalReader {
            segments,
            index: 0,
            current: None,
            finished: false,
        })
    }

    fn is_last_segment(&self) -> bool {
        self.index + 1 >= self.segments.len()
    }

    fn advance_segment(&mut self) -> Result<bool> {
        if self.current.is_some() {
            self.index += 1;
        }
        let Some(path) = self.segments.get(self.index) else {
            self.finished = true;
            return Ok(false);
        };
        let mut r = BufReader::with_capacity(1 << 20, File::open(path)?);
        // Consume and validate the header frame.
        match read_frame(&mut r)? {
            Frame::Payload(payload) => match bincode::deserialize::<WalFrame>(&payload) {
                Ok(WalFrame::Header(_)) => {}
                _ => {
                    return Err(RlxError::CorruptWal {
                        path: path.clone(),
                        detail: "first frame is not a segment header".into(),
                    });
                }
            },
            Frame::Truncated | Frame::Eof if self.is_last_segment() => {
                // Crash while the newest segment header was being written.
                self.finished = true;
                return Ok(false);
            }
            _ => {
                return Err(RlxError::CorruptWal {
                    path: path.clone(),
                    detail: "unreadable segment header".into(),
                });
            }
        }
        self.current = Some(r);
        Ok(true)
    }
}

impl Iterator for WalReader {
    type Item = Result<EnrichedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.current.is_none() {
                match self.advance_segment() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
            }
            let path = self.segments[self.index].clone();
            let r = self.current.as_mut().expect("segment open");
            match read_frame(r) {
                Ok(Frame::Payload(payload)) => {
                    return Some(match bincode::deserialize::<WalFrame>(&payload) {
                        Ok(WalFrame::Event(ev)) => Ok(ev),
                        Ok(WalFrame::Header(_)) => {
                            self.finished = true;
                            Err(RlxError::CorruptWal {
                                path,
                                detail: "unexpected header frame mid-segment".into(),
                            })
                        }
                        Err(e) => {
                            self.finished = true;
                            Err(RlxError::CorruptWal {
                                path,
                                detail: e.to_string(),
                            })
                        }
                    });
                }
                Ok(Frame::Eof) => {
                    self.current = None;
                    continue;
                }
                Ok(Frame::Truncated) => {
                    if self.is_last_segment() {
                        // Torn write at the crash point: valid prefix ends here.
                        self.finished = true;
                        return None;
                    }
                    self.finished = true;
                    return Some(Err(RlxError::CorruptWal {
                        path,
                        detail: "torn frame in non-final segment".into(),
                    }));
                }
                Ok(Frame::Corrupt { stored, computed }) => {
                    self.finished = true;
                    return Some(Err(RlxError::CorruptWal {
                        path,
                        detail: format!("event crc mismatch {stored:#x} != {computed:#x}"),
                    }));
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::Decimal;
    use crate::event::{
        ApplyNotes, EventPayload, Level, Side, TradeRecord, UnifiedEvent,
    };

    fn enriched(ts: i64) -> EnrichedEvent {
        EnrichedEvent {
            wal_seq: 0,
            event: UnifiedEvent {
                arrival_index: 0,
                payload: EventPayload::Trade(TradeRecord {
                    origin_time: ts,
                    price: Decimal::from_int(100),
                    quantity: Decimal::from_int(1),
                    side: Side::Buy,
                    trade_id: Some(ts),
                }),
            },
            bids: vec![Level::new(Decimal::from_int(99), Decimal::from_int(1))],
            asks: vec![Level::new(Decimal::from_int(101), Decimal::from_int(2))],
            notes: ApplyNotes::default(),
        }
    }

    fn open_wal(dir: &Path, next_seq: u64) -> Wal {
        Wal::open(
            dir,
            "BTCUSDT",
            &ReplayConfig::default(),
            Arc::new(Metrics::new()),
            next_seq,
            0,
        )
        .unwrap()
    }

    #[test]
    fn append_sync_scan_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let wal_dir = dir.path().join("wal");
        let mut wal = open_wal(&wal_dir, 0);
        for ts in 0..5 {
            let mut ev = enriched(ts);
            let seq = wal.append(&mut ev).unwrap();
            assert_eq!(seq, ts as u64);
            assert_eq!(ev.wal_seq, seq);
        }
        wal.sync().unwrap();
        assert_eq!(wal.high_water_mark(), Some(4));

        let events: Vec<_> = WalReader::open(&wal_dir)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[3].wal_seq, 3);
        assert_eq!(events[3].event_timestamp(), 3);
    }

    #[test]
    fn rotation_by_size_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let wal_dir = dir.path().join("wal");
        let mut cfg = ReplayConfig::default();
        cfg.wal_segment_bytes = 1024; // force frequent rotation
        let mut wal = Wal::open(
            &wal_dir,
            "BTCUSDT",
            &cfg,
            Arc::new(Metrics::new()),
            0,
            0,
        )
        .unwrap();
        for ts in 0..40 {
            wal.append(&mut enriched(ts)).unwrap();
        }
        wal.sync().unwrap();
        let before = list_segments(&wal_dir).unwrap();
        assert!(before.len() > 1, "expected rotation, got {}", before.len());

        // Everything is covered by a durable checkpoint.
        wal.truncate_below(1, Some(39)).unwrap();
        let after = list_segments(&wal_dir).unwrap();
        assert_eq!(after.len(), 1, "only the active segment survives");

        // The surviving log still scans cleanly.
        let remaining: Vec<_> = WalReader::open(&wal_dir)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[test]
    fn torn_tail_is_cut_at_last_valid_frame() {
        let dir = tempfile::tempdir().unwrap();
        let wal_dir = dir.path().join("wal");
        let mut wal = open_wal(&wal_dir, 0);
        for ts in 0..3 {
            wal.append(&mut enriched(ts)).unwrap();
        }
        wal.sync().unwrap();
        drop(wal);

        let (_, path) = list_segments(&wal_dir).unwrap().pop().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let events: Vec<_> = WalReader::open(&wal_dir)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn corrupt_frame_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let wal_dir = dir.path().join("wal");
        let mut wal = open_wal(&wal_dir, 0);
        for ts in 0..3 {
            wal.append(&mut enriched(ts)).unwrap();
        }
        wal.sync().unwrap();
        drop(wal);

        let (_, path) = list_segments(&wal_dir).unwrap().pop().unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        // Flip the final payload byte: the frame stays complete, its CRC
        // no longer matches.
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let result: Result<Vec<_>> = WalReader::open(&wal_dir).unwrap().collect();
        assert!(matches!(result, Err(RlxError::CorruptWal { .. })));
    }

    #[test]
    fn reopen_continues_sequence_in_new_segment() {
        let dir = tempfile::tempdir().unwrap();
        let wal_dir = dir.path().join("wal");
        let mut wal = open_wal(&wal_dir, 0);
        wal.append(&mut enriched(0)).unwrap();
        wal.sync().unwrap();
        drop(wal);

        let mut wal = open_wal(&wal_dir, 1);
        assert_eq!(wal.next_seq(), 1);
        wal.append(&mut enriched(1)).unwrap();
        wal.sync().unwrap();

        let seqs: Vec<_> = WalReader::open(&wal_dir)
            .unwrap()
            .map(|r| r.unwrap().wal_seq)
            .collect();
        assert_eq!(seqs, vec![0, 1]);
    }
}
