//! Event model: raw input records, the unified chronological event, and the
//! enriched (post-state annotated) event emitted downstream.
//!
//! All three input sources carry `origin_time` (nanoseconds since epoch) as
//! the master clock. The unified stream is ordered by the deterministic
//! [`SortKey`]; equal-timestamp ties resolve snapshot-first so that a delta
//! or trade lands on a freshly resynchronized book.

use crate::decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Authoritative book depth carried on enriched events and snapshots.
pub const TOP_DEPTH: usize = 20;

/// Trade aggressor direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_u8(self) -> u8 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Side::Buy),
            1 => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Order-book side affected by a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    pub fn as_u8(self) -> u8 {
        match self {
            BookSide::Bid => 0,
            BookSide::Ask => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(BookSide::Bid),
            1 => Some(BookSide::Ask),
            _ => None,
        }
    }
}

/// A single `(price, size)` book level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub size: Decimal,
}

impl Level {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Level { price, size }
    }
}

/// One executed trade, aggressor-tagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub origin_time: i64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
    pub trade_id: Option<i64>,
}

/// Periodic L2 snapshot, up to [`TOP_DEPTH`] levels per side, best first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub origin_time: i64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

/// Differential book update: absolute new quantity at one price level.
/// `new_quantity == 0` removes the level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub origin_time: i64,
    pub update_id: i64,
    pub side: BookSide,
    pub price: Decimal,
    pub new_quantity: Decimal,
}

/// Event kind; the variant order is also the tie-break priority at equal
/// `origin_time` (snapshots first, then deltas, then trades).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum EventType {
    BookSnapshot = 0,
    BookDelta = 1,
    Trade = 2,
}

impl EventType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EventType::BookSnapshot),
            1 => Some(EventType::BookDelta),
            2 => Some(EventType::Trade),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EventType::BookSnapshot => "BOOK_SNAPSHOT",
            EventType::BookDelta => "BOOK_DELTA",
            EventType::Trade => "TRADE",
        }
    }
}

/// Type-specific payload of a unified event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    Trade(TradeRecord),
    Snapshot(SnapshotRecord),
    Delta(DeltaRecord),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::Snapshot(_) => EventType::BookSnapshot,
            EventPayload::Delta(_) => EventType::BookDelta,
            EventPayload::Trade(_) => EventType::Trade,
        }
    }

    pub fn origin_time(&self) -> i64 {
        match self {
            EventPayload::Trade(t) => t.origin_time,
            EventPayload::Snapshot(s) => s.origin_time,
            EventPayload::Delta(d) => d.origin_time,
        }
    }

    pub fn update_id(&self) -> Option<i64> {
        match self {
            EventPayload::Delta(d) => Some(d.update_id),
            _ => None,
        }
    }
}

/// One event of the merged chronological stream.
///
/// `arrival_index` is a stable per-source counter: records that compare equal
/// on every other key keep their source order, which makes the merge fully
/// deterministic across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedEvent {
    pub arrival_index: u64,
    pub payload: EventPayload,
}

impl UnifiedEvent {
    pub fn origin_time(&self) -> i64 {
        self.payload.origin_time()
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn update_id(&self) -> Option<i64> {
        self.payload.update_id()
    }

    pub fn sort_key(&self) -> SortKey {
        SortKey {
            origin_time: self.origin_time(),
            type_rank: self.event_type().as_u8(),
            update_id: self.update_id().unwrap_or(0),
            arrival_index: self.arrival_index,
        }
    }
}

/// Total order over unified events:
/// (`origin_time`, type priority, `update_id`, `arrival_index`).
///
/// Only deltas carry an `update_id`, so the key orders deltas among
/// themselves by sequence while cross-source ties fall to the fixed
/// snapshot < delta < trade priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey {
    pub origin_time: i64,
    pub type_rank: u8,
    pub update_id: i64,
    pub arrival_index: u64,
}

/// Non-fatal conditions observed while applying one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyNotes {
    /// Delta carried an already-applied `update_id` and was dropped.
    pub duplicate: bool,
    /// Size of the `update_id` gap this delta jumped over, if any.
    pub gap: Option<u64>,
    /// Book integrity is provisionally suspect (gap seen, no resync yet).
    pub tainted: bool,
    /// Trade quantity that exceeded displayed liquidity.
    pub hidden_liquidity: Option<Decimal>,
    /// Relative RMS drift measured against this snapshot before resync.
    pub drift_rms: Option<f64>,
}

impl ApplyNotes {
    pub fn is_clean(&self) -> bool {
        !self.duplicate
            && self.gap.is_none()
            && !self.tainted
            && self.hidden_liquidity.is_none()
            && self.drift_rms.is_none()
    }
}

/// A unified event annotated with the book state immediately after its
/// application, plus its durable per-symbol WAL sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedEvent {
    pub wal_seq: u64,
    pub event: UnifiedEvent,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub notes: ApplyNotes,
}

impl EnrichedEvent {
    pub fn event_timestamp(&self) -> i64 {
        self.event.origin_time()
    }
}
