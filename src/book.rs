//! Stateful L2 order-book engine.
//!
//! Single-threaded, deterministic application of unified events to the book:
//! deltas are sequence-checked absolute level updates, trades consume
//! displayed liquidity from the opposite side, snapshots measure drift and
//! resynchronize. Given identical ordered inputs and identical initial state,
//! [`OrderBookEngine::apply`] produces identical enriched events and
//! end-state.
//!
//! The top [`crate::event::TOP_DEPTH`] levels per side are authoritative; deeper levels are
//! tracked in the same ordered map up to a configured bound, with the
//! farthest-from-mid level evicted first and its size folded into an
//! aggregate volume statistic.

use crate::config::ReplayConfig;
use crate::decimal::Decimal;
use crate::error::{Result, RlxError};
use crate::event::{
    ApplyNotes, BookSide, DeltaRecord, EnrichedEvent, EventPayload, Level, Side, SnapshotRecord,
    TradeRecord, UnifiedEvent,
};
use crate::metrics::{Metrics, sampled};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::warn;

/// Engine lifecycle. Only a snapshot moves the book out of `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Uninitialized,
    Initialized,
    Running,
    Draining,
    Closed,
}

/// One side of the book: ordered price -> size association plus the
/// aggregate volume evicted past the tracking bound.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideBook {
    levels: BTreeMap<Decimal, Decimal>,
    evicted_volume: Decimal,
}

impl SideBook {
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn evicted_volume(&self) -> Decimal {
        self.evicted_volume
    }

    fn clear(&mut self) {
        self.levels.clear();
        self.evicted_volume = Decimal::ZERO;
    }

    /// Absolute set: zero removes, positive replaces.
    fn set_level(&mut self, price: Decimal, size: Decimal) {
        if size.is_zero() {
            self.levels.remove(&price);
        } else {
            self.levels.insert(price, size);
        }
    }

    fn best(&self, side: BookSide) -> Option<Level> {
        match side {
            BookSide::Bid => self
                .levels
                .iter()
                .next_back()
                .map(|(p, s)| Level::new(*p, *s)),
            BookSide::Ask => self.levels.iter().next().map(|(p, s)| Level::new(*p, *s)),
        }
    }

    /// Best-first top-of-book view.
    fn top(&self, side: BookSide, n: usize) -> Vec<Level> {
        match side {
            BookSide::Bid => self
                .levels
                .iter()
                .rev()
                .take(n)
                .map(|(p, s)| Level::new(*p, *s))
                .collect(),
            BookSide::Ask => self
                .levels
                .iter()
                .take(n)
                .map(|(p, s)| Level::new(*p, *s))
                .collect(),
        }
    }

    /// Drop levels past the tracking bound, farthest from mid first,
    /// accumulating their size.
    fn enforce_bound(&mut self, side: BookSide, max_levels: usize) {
        while self.levels.len() > max_levels {
            let worst = match side {
                BookSide::Bid => self.levels.iter().next().map(|(p, _)| *p),
                BookSide::Ask => self.levels.iter().next_back().map(|(p, _)| *p),
            };
            let Some(price) = worst else { break };
            if let Some(size) = self.levels.remove(&price) {
                self.evicted_volume = self
                    .evicted_volume
                    .checked_add(size)
                    .unwrap_or(self.evicted_volume);
            }
        }
    }

    fn replace_from(&mut self, levels: &[Level]) {
        self.clear();
        for lvl in levels {
            if lvl.size.is_positive() {
                self.levels.insert(lvl.price, lvl.size);
            }
        }
    }
}

/// Serializable copy-on-write snapshot of engine state, as embedded in
/// checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookState {
    pub bids: SideBook,
    pub asks: SideBook,
    /// `None` until the first delta is applied; any i64 is a legal id.
    pub last_applied_update_id: Option<i64>,
    pub last_event_timestamp: i64,
    pub tainted: bool,
    pub initialized: bool,
}

/// The per-symbol reconstruction engine.
pub struct OrderBookEngine {
    state: EngineState,
    bids: SideBook,
    asks: SideBook,
    last_applied_update_id: Option<i64>,
    last_event_timestamp: i64,
    tainted: bool,
    pending: VecDeque<UnifiedEvent>,
    top_depth: usize,
    max_levels: usize,
    pending_limit: usize,
    drift_threshold: f64,
    consume_overflow_on_trade: bool,
    metrics: Arc<Metrics>,
}

impl OrderBookEngine {
    pub fn new(cfg: &ReplayConfig, metrics: Arc<Metrics>) -> Self {
        OrderBookEngine {
            state: EngineState::Uninitialized,
            bids: SideBook::default(),
            asks: SideBook::default(),
            last_applied_update_id: None,
            last_event_timestamp: i64::MIN,
            tainted: false,
            pending: VecDeque::new(),
            top_depth: cfg.top_depth,
            max_levels: cfg.top_depth + cfg.overflow_levels,
            pending_limit: cfg.pending_queue_limit,
            drift_threshold: cfg.drift_threshold,
            consume_overflow_on_trade: cfg.consume_overflow_on_trade,
            metrics,
        }
    }

    /// Rebuild an engine from a checkpointed [`BookState`].
    pub fn restore(cfg: &ReplayConfig, metrics: Arc<Metrics>, state: BookState) -> Self {
        let mut engine = OrderBookEngine::new(cfg, metrics);
        engine.state = if state.initialized {
            EngineState::Running
        } else {
            EngineState::Uninitialized
        };
        engine.bids = state.bids;
        engine.asks = state.asks;
        engine.last_applied_update_id = state.last_applied_update_id;
        engine.last_event_timestamp = state.last_event_timestamp;
        engine.tainted = state.tainted;
        engine
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn last_applied_update_id(&self) -> Option<i64> {
        self.last_applied_update_id
    }

    pub fn last_event_timestamp(&self) -> i64 {
        self.last_event_timestamp
    }

    /// Copy-on-write export for checkpointing.
    pub fn export_state(&self) -> BookState {
        BookState {
            bids: self.bids.clone(),
            asks: self.asks.clone(),
            last_applied_update_id: self.last_applied_update_id,
            last_event_timestamp: self.last_event_timestamp,
            tainted: self.tainted,
            initialized: !matches!(self.state, EngineState::Uninitialized),
        }
    }

    /// Top-N view of both sides, best first.
    pub fn snapshot_top(&self, n: usize) -> (Vec<Level>, Vec<Level>) {
        (
            self.bids.top(BookSide::Bid, n),
            self.asks.top(BookSide::Ask, n),
        )
    }

    pub fn begin_drain(&mut self) {
        if !matches!(self.state, EngineState::Closed) {
            self.state = EngineState::Draining;
        }
    }

    pub fn close(&mut self) {
        self.state = EngineState::Closed;
    }

    /// Apply one unified event.
    ///
    /// Usually returns exactly one enriched event. The snapshot that
    /// initializes the book additionally flushes the pending queue, so it
    /// returns `1 + pending` events; an event buffered before the first
    /// snapshot returns none.
    pub fn apply(&mut self, event: UnifiedEvent) -> Result<Vec<EnrichedEvent>> {
        match self.state {
            EngineState::Closed | EngineState::Draining => {
                return Err(RlxError::Config(
                    "event applied to a draining or closed engine".into(),
                ));
            }
            EngineState::Uninitialized => {
                if !matches!(event.payload, EventPayload::Snapshot(_)) {
                    if self.pending.len() >= self.pending_limit {
                        let buffered = self.pending.len();
                        self.pending.clear();
                        Metrics::set(&self.metrics.pending_queue_depth, 0);
                        Metrics::bump(&self.metrics.init_overflows);
                        return Err(RlxError::InitializationOverflow { buffered });
                    }
                    self.pending.push_back(event);
                    Metrics::set(
                        &self.metrics.pending_queue_depth,
                        self.pending.len() as u64,
                    );
                    return Ok(Vec::new());
                }
            }
            EngineState::Initialized | EngineState::Running => {}
        }

        let mut out = Vec::with_capacity(1);
        let first_snapshot = matches!(self.state, EngineState::Uninitialized);
        out.push(self.apply_inner(&event)?);

        if first_snapshot {
            self.state = EngineState::Initialized;
            // Replay everything buffered while waiting for this snapshot.
            let buffered: Vec<UnifiedEvent> = self.pending.drain(..).collect();
            Metrics::set(&self.metrics.pending_queue_depth, 0);
            for ev in buffered {
                out.push(self.apply_inner(&ev)?);
            }
            self.state = EngineState::Running;
        }
        Ok(out)
    }

    fn apply_inner(&mut self, event: &UnifiedEvent) -> Result<EnrichedEvent> {
        let mut notes = ApplyNotes::default();
        match &event.payload {
            EventPayload::Snapshot(snap) => self.apply_snapshot(snap, &mut notes),
            EventPayload::Delta(delta) => self.apply_delta(delta, &mut notes),
            EventPayload::Trade(trade) => self.apply_trade(trade, &mut notes)?,
        }
        notes.tainted = self.tainted;
        // Enriched timestamps stay monotone even while the initialization
        // backlog (older origin_time) replays onto a fresh book.
        self.last_event_timestamp = self.last_event_timestamp.max(event.origin_time());
        Metrics::bump(&self.metrics.events_applied);
        let (bids, asks) = self.snapshot_top(self.top_depth);
        Ok(EnrichedEvent {
            wal_seq: 0,
            event: event.clone(),
            bids,
            asks,
            notes,
        })
    }

    fn apply_snapshot(&mut self, snap: &SnapshotRecord, notes: &mut ApplyNotes) {
        if !matches!(self.state, EngineState::Uninitialized) {
            let drift = self.drift_relative_rms(snap);
            notes.drift_rms = Some(drift);
            self.metrics.record_drift(drift);
            if drift > self.drift_threshold {
                let n = Metrics::bump(&self.metrics.high_drift);
                if sampled(n) {
                    warn!(drift, threshold = self.drift_threshold, "high snapshot drift");
                }
            }
        }
        // Resynchronization: the snapshot's top levels become authoritative,
        // deeper tracked levels are discarded, taint clears.
        if self.tainted {
            Metrics::bump(&self.metrics.resyncs_after_gap);
        }
        self.bids.replace_from(&snap.bids);
        self.asks.replace_from(&snap.asks);
        self.tainted = false;
        Metrics::bump(&self.metrics.snapshots_applied);
    }

    fn apply_delta(&mut self, delta: &DeltaRecord, notes: &mut ApplyNotes) {
        // The first delta ever seen sets the sequence baseline; after that
        // every id is checked, whatever its numeric value.
        match self.last_applied_update_id {
            Some(last) if delta.update_id <= last => {
                notes.duplicate = true;
                let n = Metrics::bump(&self.metrics.duplicate_delta);
                if sampled(n) {
                    warn!(
                        update_id = delta.update_id,
                        last, "duplicate delta dropped"
                    );
                }
                return;
            }
            Some(last) if delta.update_id > last + 1 => {
                let gap = (delta.update_id - last - 1) as u64;
                notes.gap = Some(gap);
                self.tainted = true;
                let n = Metrics::bump(&self.metrics.gap_detected);
                Metrics::add(&self.metrics.gap_updates_skipped, gap);
                if sampled(n) {
                    warn!(
                        gap,
                        update_id = delta.update_id,
                        "delta sequence gap, book tainted until next snapshot"
                    );
                }
            }
            _ => {}
        }
        let side = match delta.side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        side.set_level(delta.price, delta.new_quantity);
        side.enforce_bound(delta.side, self.max_levels);
        if delta.new_quantity.is_positive() {
            self.uncross(delta.side, delta.price);
        }
        self.last_applied_update_id = Some(delta.update_id);
        Metrics::bump(&self.metrics.deltas_applied);
    }

    /// A level set through the opposite side means those resting levels are
    /// stale (their removal update was lost or is still in flight). Drop
    /// them so the top of book never crosses.
    fn uncross(&mut self, side: BookSide, price: Decimal) {
        let opposite = match side {
            BookSide::Bid => &mut self.asks,
            BookSide::Ask => &mut self.bids,
        };
        let stale: Vec<Decimal> = match side {
            BookSide::Bid => opposite
                .levels
                .range(..=price)
                .map(|(p, _)| *p)
                .collect(),
            BookSide::Ask => opposite
                .levels
                .range(price..)
                .map(|(p, _)| *p)
                .collect(),
        };
        if stale.is_empty() {
            return;
        }
        for p in &stale {
            opposite.levels.remove(p);
        }
        let n = Metrics::bump(&self.metrics.crossed_levels_removed);
        Metrics::add(&self.metrics.crossed_levels_removed, stale.len() as u64 - 1);
        if sampled(n) {
            warn!(
                removed = stale.len(),
                through = %price,
                "crossed opposite levels removed"
            );
        }
    }

    fn apply_trade(&mut self, trade: &TradeRecord, notes: &mut ApplyNotes) -> Result<()> {
        // A BUY aggressor lifts asks, a SELL aggressor hits bids. The trade
        // never crosses the spread in the book model: no implicit levels.
        let (book, side) = match trade.side {
            Side::Buy => (&mut self.asks, BookSide::Ask),
            Side::Sell => (&mut self.bids, BookSide::Bid),
        };
        let walk_limit = if self.consume_overflow_on_trade {
            usize::MAX
        } else {
            self.top_depth
        };
        let mut remaining = trade.quantity;
        let plan = book.top(side, walk_limit);
        for level in plan {
            if remaining.is_zero() {
                break;
            }
            if remaining >= level.size {
                remaining = remaining.checked_sub(level.size)?;
                book.set_level(level.price, Decimal::ZERO);
            } else {
                let left = level.size.checked_sub(remaining)?;
                book.set_level(level.price, left);
                remaining = Decimal::ZERO;
            }
        }
        if remaining.is_positive() {
            notes.hidden_liquidity = Some(remaining);
            let n = Metrics::bump(&self.metrics.hidden_liquidity_events);
            if sampled(n) {
                warn!(remainder = %remaining, "trade consumed beyond displayed liquidity");
            }
        }
        Metrics::bump(&self.metrics.trades_applied);
        Ok(())
    }

    /// Relative RMS of per-level notional differences between the current
    /// top levels and an incoming snapshot's.
    fn drift_relative_rms(&self, snap: &SnapshotRecord) -> f64 {
        let cur_bids = self.bids.top(BookSide::Bid, self.top_depth);
        let cur_asks = self.asks.top(BookSide::Ask, self.top_depth);
        let mut sum_sq = 0.0f64;
        let mut ref_sum = 0.0f64;
        let mut count = 0u32;
        for (cur, auth) in [(&cur_bids, &snap.bids), (&cur_asks, &snap.asks)] {
            let n = cur.len().max(auth.len()).min(self.top_depth);
            for i in 0..n {
                let c = cur
                    .get(i)
                    .map(|l| l.price.to_f64() * l.size.to_f64())
                    .unwrap_or(0.0);
                let a = auth
                    .get(i)
                    .map(|l| l.price.to_f64() * l.size.to_f64())
                    .unwrap_or(0.0);
                sum_sq += (c - a) * (c - a);
                ref_sum += a.abs();
                count += 1;
            }
        }
        if count == 0 {
            return 0.0;
        }
        let rms = (sum_sq / count as f64).sqrt();
        let ref_mean = ref_sum / count as f64;
        if ref_mean > 0.0 { rms / ref_mean } else { rms }
    }

    /// Best bid / best ask, for invariant checks and health reporting.
    pub fn top_of_book(&self) -> (Option<Level>, Option<Level>) {
        (self.bids.best(BookSide::Bid), self.asks.best(BookSide::Ask))
    }
}
