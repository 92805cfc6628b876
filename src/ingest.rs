//! Ingestion readers: stream trades, snapshots and deltas from partitioned
//! columnar files in micro-batches.
//!
//! Each reader walks its table's `symbol/date/hour` partition directories in
//! lexical (= chronological) order, decodes row groups into typed records and
//! pushes micro-batches into a bounded channel. A full channel blocks the
//! reader, which is the backpressure path; readers never reorder or enrich.
//!
//! Malformed files surface as `SchemaError`/`DecodeError`: the offending
//! file is skipped, counted and the reader continues. Transient I/O faults
//! are retried with exponential backoff before they become fatal.

use crate::columnar::{
    ColumnKind, ColumnValues, ColumnarReader, RowGroup, TableSchema, book_schema, deltas_schema,
    trades_schema,
};
use crate::config::ReplayConfig;
use crate::decimal::Decimal;
use crate::error::{Result, RlxError};
use crate::event::{
    BookSide, DeltaRecord, EventPayload, EventType, Level, Side, SnapshotRecord, TOP_DEPTH,
    TradeRecord,
};
use crate::metrics::Metrics;
use crate::unify::SourceBatch;
use crossbeam_channel::Sender;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::macros::format_description;
use tracing::{debug, warn};

/// Input table directory names.
pub const TABLE_TRADES: &str = "trades";
pub const TABLE_BOOK: &str = "book";
pub const TABLE_DELTAS: &str = "book_delta_v2";

/// Table metadata for one source kind.
pub fn table_for(kind: EventType) -> (&'static str, TableSchema) {
    match kind {
        EventType::Trade => (TABLE_TRADES, trades_schema()),
        EventType::BookSnapshot => (TABLE_BOOK, book_schema()),
        EventType::BookDelta => (TABLE_DELTAS, deltas_schema()),
    }
}

/// List this table's partition files for `symbol` overlapping
/// `[from_ns, to_ns)`, in chronological order.
pub fn discover_partitions(
    data_root: &Path,
    table: &str,
    symbol: &str,
    from_ns: i64,
    to_ns: i64,
) -> Result<Vec<PathBuf>> {
    let date_fmt = format_description!("[year]-[month]-[day]");
    let base = data_root.join(table).join(symbol);
    let mut files = Vec::new();
    if !base.exists() {
        return Ok(files);
    }
    let mut date_dirs: Vec<PathBuf> = std::fs::read_dir(&base)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    date_dirs.sort();
    for date_dir in date_dirs {
        let Some(name) = date_dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Ok(date) = time::Date::parse(name, &date_fmt) else {
            debug!(dir = %date_dir.display(), "skipping non-date directory");
            continue;
        };
        let mut hour_dirs: Vec<PathBuf> = std::fs::read_dir(&date_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        hour_dirs.sort();
        for hour_dir in hour_dirs {
            let Some(hname) = hour_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(hour) = hname.parse::<u8>() else {
                continue;
            };
            if hour > 23 {
                continue;
            }
            let start = date
                .with_hms(hour, 0, 0)
                .map_err(|e| RlxError::Config(e.to_string()))?
                .assume_utc()
                .unix_timestamp_nanos() as i64;
            let end = start + 3_600_000_000_000;
            if end <= from_ns || start >= to_ns {
                continue;
            }
            let mut part_files: Vec<PathBuf> = std::fs::read_dir(&hour_dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .and_then(|x| x.to_str())
                        .is_some_and(|x| x == crate::columnar::FILE_EXT)
                })
                .collect();
            part_files.sort();
            files.extend(part_files);
        }
    }
    Ok(files)
}

/// Retry an I/O-bound operation with exponential backoff
/// (base `base_ms`, doubling, up to `attempts`).
fn with_retry<T>(
    metrics: &Metrics,
    attempts: u32,
    base_ms: u64,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay = Duration::from_millis(base_ms);
    let mut tries = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient_io() && tries + 1 < attempts => {
                tries += 1;
                Metrics::bump(&metrics.io_retries);
                warn!(attempt = tries, error = %e, "transient I/O fault, backing off");
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Stream one source's partition files as micro-batches into `tx`.
///
/// Runs on a dedicated reader thread; returning closes the channel. A fatal
/// fault is forwarded as the final message so the consumer sees it in-band.
pub fn run_reader(
    kind: EventType,
    files: &[PathBuf],
    from_ns: i64,
    to_ns: i64,
    cfg: &ReplayConfig,
    metrics: &Metrics,
    tx: &Sender<Result<SourceBatch>>,
) {
    let (_, schema) = table_for(kind);
    let mut batch: SourceBatch = Vec::with_capacity(cfg.batch_size);
    for path in files {
        let opened = with_retry(metrics, cfg.io_retry_attempts, cfg.io_retry_base_ms, || {
            ColumnarReader::open(path)
        });
        let mut reader = match opened {
            Ok(r) => r,
            Err(e @ RlxError::Io(_)) => {
                let _ = tx.send(Err(e));
                return;
            }
            Err(e) => {
                Metrics::bump(&metrics.schema_errors);
                warn!(path = %path.display(), error = %e, "unreadable partition file skipped");
                continue;
            }
        };
        if let Err(e) = reader.schema().check_required(path, &schema.columns) {
            Metrics::bump(&metrics.schema_errors);
            warn!(path = %path.display(), error = %e, "partition file schema rejected");
            continue;
        }
        loop {
            match reader.read_group() {
                Ok(None) => break,
                Ok(Some(group)) => match decode_group(kind, reader.schema(), &group, path) {
                    Ok(events) => {
                        for ev in events {
                            let ts = ev.origin_time();
                            if ts < from_ns || ts >= to_ns {
                                continue;
                            }
                            batch.push(ev);
                            if batch.len() >= cfg.batch_size
                                && tx
                                    .send(Ok(std::mem::replace(
                                        &mut batch,
                                        Vec::with_capacity(cfg.batch_size),
                                    )))
                                    .is_err()
                            {
                                return; // consumer gone
                            }
                        }
                    }
                    Err(e) => {
                        Metrics::bump(&metrics.decode_errors);
                        warn!(path = %path.display(), error = %e, "row group skipped");
                    }
                },
                Err(e @ RlxError::Io(_)) => {
                    let _ = tx.send(Err(e));
                    return;
                }
                Err(e) => {
                    // Framing is gone; nothing after this point is trustworthy.
                    Metrics::bump(&metrics.decode_errors);
                    warn!(path = %path.display(), error = %e, "rest of file skipped");
                    break;
                }
            }
        }
    }
    if !batch.is_empty() {
        let _ = tx.send(Ok(batch));
    }
}

// ---------------------------------------------------------------------------
// Row-group decoding
// ---------------------------------------------------------------------------

pub(crate) fn decode_group(
    kind: EventType,
    schema: &TableSchema,
    group: &RowGroup,
    path: &Path,
) -> Result<Vec<EventPayload>> {
    match kind {
        EventType::Trade => decode_trades(schema, group, path),
        EventType::BookSnapshot => decode_snapshots(schema, group, path),
        EventType::BookDelta => decode_deltas(schema, group, path),
    }
}

fn col<'g>(
    schema: &TableSchema,
    group: &'g RowGroup,
    name: &str,
    kind: ColumnKind,
    path: &Path,
) -> Result<&'g ColumnValues> {
    let idx = schema.column_index(name).ok_or_else(|| RlxError::Schema {
        path: path.to_path_buf(),
        detail: format!("missing column {name:?}"),
    })?;
    let values = &group.columns[idx];
    if values.kind() != kind {
        return Err(RlxError::Decode {
            path: path.to_path_buf(),
            detail: format!("column {name:?} has unexpected kind"),
        });
    }
    Ok(values)
}

macro_rules! unwrap_col {
    ($values:expr, $variant:ident) => {
        match $values {
            ColumnValues::$variant(v) => v,
            _ => unreachable!("kind checked above"),
        }
    };
}

fn decode_trades(schema: &TableSchema, group: &RowGroup, path: &Path) -> Result<Vec<EventPayload>> {
    let ts = unwrap_col!(col(schema, group, "origin_time", ColumnKind::I64, path)?, I64);
    let price = unwrap_col!(col(schema, group, "price", ColumnKind::Decimal, path)?, Decimal);
    let qty = unwrap_col!(
        col(schema, group, "quantity", ColumnKind::Decimal, path)?,
        Decimal
    );
    let side = unwrap_col!(col(schema, group, "side", ColumnKind::U8, path)?, U8);
    let trade_id = unwrap_col!(
        col(schema, group, "trade_id", ColumnKind::OptI64, path)?,
        OptI64
    );
    let mut out = Vec::with_capacity(group.rows());
    for i in 0..group.rows() {
        let side = Side::from_u8(side[i]).ok_or_else(|| RlxError::Decode {
            path: path.to_path_buf(),
            detail: format!("invalid trade side code {}", side[i]),
        })?;
        out.push(EventPayload::Trade(TradeRecord {
            origin_time: ts[i],
            price: Decimal::from_raw(price[i]),
            quantity: Decimal::from_raw(qty[i]),
            side,
            trade_id: trade_id[i],
        }));
    }
    Ok(out)
}

fn decode_snapshots(
    schema: &TableSchema,
    group: &RowGroup,
    path: &Path,
) -> Result<Vec<EventPayload>> {
    let ts = unwrap_col!(col(schema, group, "origin_time", ColumnKind::I64, path)?, I64);
    let bids = unwrap_col!(
        col(schema, group, "bids", ColumnKind::LevelList, path)?,
        LevelList
    );
    let asks = unwrap_col!(
        col(schema, group, "asks", ColumnKind::LevelList, path)?,
        LevelList
    );
    let mut out = Vec::with_capacity(group.rows());
    for i in 0..group.rows() {
        out.push(EventPayload::Snapshot(SnapshotRecord {
            origin_time: ts[i],
            bids: decode_levels(&bids[i]),
            asks: decode_levels(&asks[i]),
        }));
    }
    Ok(out)
}

fn decode_deltas(schema: &TableSchema, group: &RowGroup, path: &Path) -> Result<Vec<EventPayload>> {
    let ts = unwrap_col!(col(schema, group, "origin_time", ColumnKind::I64, path)?, I64);
    let update_id = unwrap_col!(col(schema, group, "update_id", ColumnKind::I64, path)?, I64);
    let side = unwrap_col!(col(schema, group, "side", ColumnKind::U8, path)?, U8);
    let price = unwrap_col!(col(schema, group, "price", ColumnKind::Decimal, path)?, Decimal);
    let qty = unwrap_col!(
        col(schema, group, "new_quantity", ColumnKind::Decimal, path)?,
        Decimal
    );
    let mut out = Vec::with_capacity(group.rows());
    for i in 0..group.rows() {
        let side = BookSide::from_u8(side[i]).ok_or_else(|| RlxError::Decode {
            path: path.to_path_buf(),
            detail: format!("invalid delta side code {}", side[i]),
        })?;
        out.push(EventPayload::Delta(DeltaRecord {
            origin_time: ts[i],
            update_id: update_id[i],
            side,
            price: Decimal::from_raw(price[i]),
            new_quantity: Decimal::from_raw(qty[i]),
        }));
    }
    Ok(out)
}

fn decode_levels(pairs: &[(i128, i128)]) -> Vec<Level> {
    pairs
        .iter()
        .take(TOP_DEPTH)
        .map(|(p, s)| Level::new(Decimal::from_raw(*p), Decimal::from_raw(*s)))
        .collect()
}
