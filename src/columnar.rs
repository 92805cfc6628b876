//! Row-group-chunked columnar container used for the three input tables and
//! for sink output partitions.
//!
//! Files are a sequence of framed records, the same append-friendly framing
//! as the WAL:
//! - Each frame is `[len:u32][crc32:u32][payload:len bytes]` (little-endian).
//! - `payload` is a bincode-serialized [`FileFrame`].
//! - CRC32 is computed over `payload` only.
//!
//! The first frame is always [`FileFrame::Schema`]; subsequent frames are
//! [`FileFrame::Group`] row groups. Readers validate the schema before
//! touching data and reject files missing required columns. Row groups are
//! decoded one at a time, which keeps reader residency at
//! O(batch_size x row width).

use crate::error::{Result, RlxError};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// File extension for columnar containers.
pub const FILE_EXT: &str = "rlxc";

// ---------------------------------------------------------------------------
// Framing (shared with the WAL and checkpoint files)
// ---------------------------------------------------------------------------

/// Outcome of pulling one frame off a stream.
#[derive(Debug)]
pub enum Frame {
    /// Clean end of stream (zero bytes available).
    Eof,
    /// Stream ended mid-frame; the tail is a torn write.
    Truncated,
    /// Payload present but the stored CRC does not match.
    Corrupt { stored: u32, computed: u32 },
    /// A verified payload.
    Payload(Vec<u8>),
}

/// Append one `[len][crc][payload]` frame.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> std::io::Result<()> {
    let mut hasher = Crc32::new();
    hasher.update(payload);
    let crc = hasher.finalize();
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(payload)?;
    Ok(())
}

/// Read one frame, distinguishing clean EOF, torn tails and CRC mismatches.
pub fn read_frame<R: Read>(r: &mut R) -> std::io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(r, &mut len_buf)? {
        ReadOutcome::Eof => return Ok(Frame::Eof),
        ReadOutcome::Partial => return Ok(Frame::Truncated),
        ReadOutcome::Full => {}
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut crc_buf = [0u8; 4];
    match read_exact_or_eof(r, &mut crc_buf)? {
        ReadOutcome::Full => {}
        _ => return Ok(Frame::Truncated),
    }
    let stored = u32::from_le_bytes(crc_buf);
    let mut payload = vec![0u8; len];
    match read_exact_or_eof(r, &mut payload)? {
        ReadOutcome::Full => {}
        _ => return Ok(Frame::Truncated),
    }
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let computed = hasher.finalize();
    if computed != stored {
        return Ok(Frame::Corrupt { stored, computed });
    }
    Ok(Frame::Payload(payload))
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Full)
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Physical type of one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    I64,
    OptI64,
    U8,
    OptU8,
    /// decimal128(38,18) mantissa.
    Decimal,
    OptDecimal,
    /// Ordered `(price, size)` decimal pairs, best level first.
    LevelList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ColumnKind) -> Self {
        ColumnSpec {
            name: name.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub version: u16,
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn new(table: &str, columns: Vec<ColumnSpec>) -> Self {
        TableSchema {
            table: table.to_string(),
            version: 1,
            columns,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Check that every column of `required` is present with the right kind.
    pub fn check_required(&self, path: &Path, required: &[ColumnSpec]) -> Result<()> {
        for want in required {
            match self.columns.iter().find(|c| c.name == want.name) {
                Some(have) if have.kind == want.kind => {}
                Some(have) => {
                    return Err(RlxError::Schema {
                        path: path.to_path_buf(),
                        detail: format!(
                            "column {:?} has kind {:?}, expected {:?}",
                            want.name, have.kind, want.kind
                        ),
                    });
                }
                None => {
                    return Err(RlxError::Schema {
                        path: path.to_path_buf(),
                        detail: format!("missing required column {:?}", want.name),
                    });
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnValues {
    I64(Vec<i64>),
    OptI64(Vec<Option<i64>>),
    U8(Vec<u8>),
    OptU8(Vec<Option<u8>>),
    Decimal(Vec<i128>),
    OptDecimal(Vec<Option<i128>>),
    LevelList(Vec<Vec<(i128, i128)>>),
}

impl ColumnValues {
    pub fn len(&self) -> usize {
        match self {
            ColumnValues::I64(v) => v.len(),
            ColumnValues::OptI64(v) => v.len(),
            ColumnValues::U8(v) => v.len(),
            ColumnValues::OptU8(v) => v.len(),
            ColumnValues::Decimal(v) => v.len(),
            ColumnValues::OptDecimal(v) => v.len(),
            ColumnValues::LevelList(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            ColumnValues::I64(_) => ColumnKind::I64,
            ColumnValues::OptI64(_) => ColumnKind::OptI64,
            ColumnValues::U8(_) => ColumnKind::U8,
            ColumnValues::OptU8(_) => ColumnKind::OptU8,
            ColumnValues::Decimal(_) => ColumnKind::Decimal,
            ColumnValues::OptDecimal(_) => ColumnKind::OptDecimal,
            ColumnValues::LevelList(_) => ColumnKind::LevelList,
        }
    }
}

/// One row group: a column vector per schema column, equal lengths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowGroup {
    pub columns: Vec<ColumnValues>,
}

impl RowGroup {
    pub fn rows(&self) -> usize {
        self.columns.first().map(ColumnValues::len).unwrap_or(0)
    }

    fn check_against(&self, schema: &TableSchema, path: &Path) -> Result<()> {
        if self.columns.len() != schema.columns.len() {
            return Err(RlxError::Decode {
                path: path.to_path_buf(),
                detail: format!(
                    "row group has {} columns, schema has {}",
                    self.columns.len(),
                    schema.columns.len()
                ),
            });
        }
        let rows = self.rows();
        for (vals, spec) in self.columns.iter().zip(&schema.columns) {
            if vals.kind() != spec.kind {
                return Err(RlxError::Decode {
                    path: path.to_path_buf(),
                    detail: format!("column {:?} kind mismatch", spec.name),
                });
            }
            if vals.len() != rows {
                return Err(RlxError::Decode {
                    path: path.to_path_buf(),
                    detail: format!("column {:?} length mismatch", spec.name),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum FileFrame {
    Schema(TableSchema),
    Group(RowGroup),
}

// ---------------------------------------------------------------------------
// Writer / reader
// ---------------------------------------------------------------------------

/// Streaming columnar writer. The caller owns durability (flush/fsync/rename
/// discipline lives in the sink).
pub struct ColumnarWriter {
    w: BufWriter<File>,
    schema: TableSchema,
    rows_written: u64,
}

impl ColumnarWriter {
    pub fn create(path: &Path, schema: TableSchema) -> Result<Self> {
        let file = File::create(path)?;
        let mut w = BufWriter::with_capacity(1 << 20, file); // 1 MiB buffer
        let payload = bincode::serialize(&FileFrame::Schema(schema.clone())).map_err(|e| {
            RlxError::Decode {
                path: path.to_path_buf(),
                detail: e.to_string(),
            }
        })?;
        write_frame(&mut w, &payload)?;
        Ok(ColumnarWriter {
            w,
            schema,
            rows_written: 0,
        })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn write_group(&mut self, group: &RowGroup) -> Result<()> {
        debug_assert_eq!(group.columns.len(), self.schema.columns.len());
        self.rows_written += group.rows() as u64;
        let payload =
            bincode::serialize(&FileFrame::Group(group.clone())).map_err(std::io::Error::other)?;
        write_frame(&mut self.w, &payload)?;
        Ok(())
    }

    /// Flush buffered frames and fsync the file.
    pub fn sync(&mut self) -> Result<()> {
        self.w.flush()?;
        self.w.get_ref().sync_all()?;
        Ok(())
    }
}

/// Streaming columnar reader; yields one row group at a time.
pub struct ColumnarReader {
    r: BufReader<File>,
    path: PathBuf,
    schema: TableSchema,
}

impl ColumnarReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut r = BufReader::with_capacity(1 << 20, file);
        let frame = read_frame(&mut r)?;
        let payload = match frame {
            Frame::Payload(p) => p,
            Frame::Eof | Frame::Truncated => {
                return Err(RlxError::Schema {
                    path: path.to_path_buf(),
                    detail: "file has no schema frame".into(),
                });
            }
            Frame::Corrupt { stored, computed } => {
                return Err(RlxError::Decode {
                    path: path.to_path_buf(),
                    detail: format!("schema frame crc mismatch {stored:#x} != {computed:#x}"),
                });
            }
        };
        let schema = match bincode::deserialize::<FileFrame>(&payload) {
            Ok(FileFrame::Schema(s)) => s,
            Ok(_) => {
                return Err(RlxError::Schema {
                    path: path.to_path_buf(),
                    detail: "first frame is not a schema".into(),
                });
            }
            Err(e) => {
                return Err(RlxError::Decode {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                });
            }
        };
        Ok(ColumnarReader {
            r,
            path: path.to_path_buf(),
            schema,
        })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next row group, or `None` at clean EOF.
    pub fn read_group(&mut self) -> Result<Option<RowGroup>> {
        match read_frame(&mut self.r)? {
            Frame::Eof => Ok(None),
            Frame::Truncated => Err(RlxError::Decode {
                path: self.path.clone(),
                detail: "torn frame at end of file".into(),
            }),
            Frame::Corrupt { stored, computed } => Err(RlxError::Decode {
                path: self.path.clone(),
                detail: format!("row group crc mismatch {stored:#x} != {computed:#x}"),
            }),
            Frame::Payload(payload) => match bincode::deserialize::<FileFrame>(&payload) {
                Ok(FileFrame::Group(g)) => {
                    g.check_against(&self.schema, &self.path)?;
                    Ok(Some(g))
                }
                Ok(_) => Err(RlxError::Decode {
                    path: self.path.clone(),
                    detail: "unexpected schema frame mid-file".into(),
                }),
                Err(e) => Err(RlxError::Decode {
                    path: self.path.clone(),
                    detail: e.to_string(),
                }),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical table schemas
// ---------------------------------------------------------------------------

/// `trades` input table.
pub fn trades_schema() -> TableSchema {
    TableSchema::new(
        "trades",
        vec![
            ColumnSpec::new("origin_time", ColumnKind::I64),
            ColumnSpec::new("price", ColumnKind::Decimal),
            ColumnSpec::new("quantity", ColumnKind::Decimal),
            ColumnSpec::new("side", ColumnKind::U8),
            ColumnSpec::new("trade_id", ColumnKind::OptI64),
        ],
    )
}

/// `book` (snapshot) input table. The vendor's wide 20-level layout is
/// normalized into level-list columns at the boundary.
pub fn book_schema() -> TableSchema {
    TableSchema::new(
        "book",
        vec![
            ColumnSpec::new("origin_time", ColumnKind::I64),
            ColumnSpec::new("bids", ColumnKind::LevelList),
            ColumnSpec::new("asks", ColumnKind::LevelList),
        ],
    )
}

/// `book_delta_v2` input table.
pub fn deltas_schema() -> TableSchema {
    TableSchema::new(
        "book_delta_v2",
        vec![
            ColumnSpec::new("origin_time", ColumnKind::I64),
            ColumnSpec::new("update_id", ColumnKind::I64),
            ColumnSpec::new("side", ColumnKind::U8),
            ColumnSpec::new("price", ColumnKind::Decimal),
            ColumnSpec::new("new_quantity", ColumnKind::Decimal),
        ],
    )
}

/// Enriched-event output table.
pub fn events_schema() -> TableSchema {
    TableSchema::new(
        "events",
        vec![
            ColumnSpec::new("event_timestamp", ColumnKind::I64),
            ColumnSpec::new("event_type", ColumnKind::U8),
            ColumnSpec::new("update_id", ColumnKind::OptI64),
            ColumnSpec::new("trade_price", ColumnKind::OptDecimal),
            ColumnSpec::new("trade_quantity", ColumnKind::OptDecimal),
            ColumnSpec::new("trade_side", ColumnKind::OptU8),
            ColumnSpec::new("trade_id", ColumnKind::OptI64),
            ColumnSpec::new("delta_side", ColumnKind::OptU8),
            ColumnSpec::new("delta_price", ColumnKind::OptDecimal),
            ColumnSpec::new("delta_quantity", ColumnKind::OptDecimal),
            ColumnSpec::new("snapshot_bids", ColumnKind::LevelList),
            ColumnSpec::new("snapshot_asks", ColumnKind::LevelList),
            ColumnSpec::new("bid_state", ColumnKind::LevelList),
            ColumnSpec::new("ask_state", ColumnKind::LevelList),
        ],
    )
}
