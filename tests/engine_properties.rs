//! Property-based invariants of the engine, unifier and decimal layer.

use proptest::prelude::*;
use rlx_replay::book::OrderBookEngine;
use rlx_replay::config::{OutOfOrderPolicy, ReplayConfig};
use rlx_replay::decimal::{Decimal, ONE_RAW, PipsCodec};
use rlx_replay::error::Result;
use rlx_replay::event::{
    BookSide, DeltaRecord, EventPayload, Level, Side, SnapshotRecord, TradeRecord, UnifiedEvent,
};
use rlx_replay::metrics::Metrics;
use rlx_replay::unify::Unifier;
use std::sync::Arc;

fn cents(c: i64) -> Decimal {
    Decimal::from_raw(c as i128 * (ONE_RAW / 100))
}

fn units(u: i64) -> Decimal {
    Decimal::from_int(u)
}

fn arb_levels(base_cents: i64, below: bool) -> impl Strategy<Value = Vec<Level>> {
    prop::collection::vec((1i64..=20, 1i64..=50), 0..6).prop_map(move |pairs| {
        let mut levels: Vec<Level> = pairs
            .into_iter()
            .map(|(off, qty)| {
                let price = if below {
                    base_cents - off
                } else {
                    base_cents + off
                };
                Level::new(cents(price), units(qty))
            })
            .collect();
        // Best level first, one entry per price.
        levels.sort_by(|a, b| {
            if below {
                b.price.cmp(&a.price)
            } else {
                a.price.cmp(&b.price)
            }
        });
        levels.dedup_by(|a, b| a.price == b.price);
        levels
    })
}

#[derive(Debug, Clone)]
enum Step {
    Snapshot { bids: Vec<Level>, asks: Vec<Level> },
    Delta { gap: i64, side: BookSide, price_cents: i64, qty: i64 },
    Trade { side: Side, price_cents: i64, qty: i64 },
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (arb_levels(10_000, true), arb_levels(10_000, false))
            .prop_map(|(bids, asks)| Step::Snapshot { bids, asks }),
        (0i64..=2, prop::bool::ANY, 9_980i64..=10_020, 0i64..=50).prop_map(
            |(gap, bid, price_cents, qty)| Step::Delta {
                gap,
                side: if bid { BookSide::Bid } else { BookSide::Ask },
                price_cents,
                qty,
            }
        ),
        (prop::bool::ANY, 9_980i64..=10_020, 1i64..=30).prop_map(|(buy, price_cents, qty)| {
            Step::Trade {
                side: if buy { Side::Buy } else { Side::Sell },
                price_cents,
                qty,
            }
        }),
    ]
}

// Sequence ids start at 0: a legal value that the engine's baseline
// handling must treat like any other.
fn steps_to_events(steps: Vec<Step>) -> Vec<UnifiedEvent> {
    let mut update_id = -1i64;
    steps
        .into_iter()
        .enumerate()
        .map(|(i, step)| {
            let ts = 1_000 + i as i64;
            let payload = match step {
                Step::Snapshot { bids, asks } => EventPayload::Snapshot(SnapshotRecord {
                    origin_time: ts,
                    bids,
                    asks,
                }),
                Step::Delta {
                    gap,
                    side,
                    price_cents,
                    qty,
                } => {
                    update_id += 1 + gap;
                    EventPayload::Delta(DeltaRecord {
                        origin_time: ts,
                        update_id,
                        side,
                        price: cents(price_cents),
                        new_quantity: units(qty),
                    })
                }
                Step::Trade {
                    side,
                    price_cents,
                    qty,
                } => EventPayload::Trade(TradeRecord {
                    origin_time: ts,
                    price: cents(price_cents),
                    quantity: units(qty),
                    side,
                    trade_id: None,
                }),
            };
            UnifiedEvent {
                arrival_index: i as u64,
                payload,
            }
        })
        .collect()
}

fn fresh_engine() -> OrderBookEngine {
    OrderBookEngine::new(&ReplayConfig::default(), Arc::new(Metrics::new()))
}

/// A sequence beginning at `update_id == 0` gets full duplicate and gap
/// detection; zero is a value, not an "unset" marker.
#[test]
fn update_id_zero_is_sequenced_like_any_other() {
    let mut engine = fresh_engine();
    let snap = UnifiedEvent {
        arrival_index: 0,
        payload: EventPayload::Snapshot(SnapshotRecord {
            origin_time: 1,
            bids: vec![Level::new(cents(9_999), units(1))],
            asks: vec![Level::new(cents(10_001), units(1))],
        }),
    };
    engine.apply(snap).unwrap();
    let delta = |ts: i64, idx: u64, update_id: i64| UnifiedEvent {
        arrival_index: idx,
        payload: EventPayload::Delta(DeltaRecord {
            origin_time: ts,
            update_id,
            side: BookSide::Bid,
            price: cents(9_999),
            new_quantity: units(2),
        }),
    };
    assert!(!engine.apply(delta(2, 1, 0)).unwrap()[0].notes.duplicate);
    let dup = engine.apply(delta(3, 2, 0)).unwrap();
    assert!(dup[0].notes.duplicate);
    let gapped = engine.apply(delta(4, 3, 2)).unwrap();
    assert_eq!(gapped[0].notes.gap, Some(1));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Monotone book state, positive quantities and an uncrossed top of
    /// book, for every prefix of any event sequence.
    #[test]
    fn engine_invariants_hold_on_any_sequence(steps in prop::collection::vec(arb_step(), 1..60)) {
        let mut engine = fresh_engine();
        let mut last_ts = i64::MIN;
        let mut last_update: Option<i64> = None;
        for event in steps_to_events(steps) {
            let out = engine.apply(event).unwrap();
            prop_assert!(engine.last_event_timestamp() >= last_ts);
            last_ts = engine.last_event_timestamp();
            prop_assert!(engine.last_applied_update_id() >= last_update);
            last_update = engine.last_applied_update_id();
            for enriched in &out {
                for level in enriched.bids.iter().chain(&enriched.asks) {
                    prop_assert!(level.size.is_positive(), "zero/negative stored level");
                }
                if let (Some(bid), Some(ask)) = (
                    enriched.bids.first(),
                    enriched.asks.first(),
                ) {
                    prop_assert!(bid.price < ask.price, "crossed book emitted");
                }
            }
        }
    }

    /// Applying the same snapshot twice in a row leaves identical state.
    #[test]
    fn snapshot_resync_is_idempotent(
        prefix in prop::collection::vec(arb_step(), 0..20),
        bids in arb_levels(10_000, true),
        asks in arb_levels(10_000, false),
    ) {
        let mut engine = fresh_engine();
        // Initialize first so the prefix runs through a live book and the
        // snapshots under test are pure resyncs.
        engine
            .apply(UnifiedEvent {
                arrival_index: 0,
                payload: EventPayload::Snapshot(SnapshotRecord {
                    origin_time: 0,
                    bids: vec![Level::new(cents(9_990), units(1))],
                    asks: vec![Level::new(cents(10_010), units(1))],
                }),
            })
            .unwrap();
        for event in steps_to_events(prefix) {
            engine.apply(event).unwrap();
        }
        let snap = |ts: i64, idx: u64| UnifiedEvent {
            arrival_index: idx,
            payload: EventPayload::Snapshot(SnapshotRecord {
                origin_time: ts,
                bids: bids.clone(),
                asks: asks.clone(),
            }),
        };
        engine.apply(snap(100_000, 1_000)).unwrap();
        let first = engine.export_state();
        engine.apply(snap(100_001, 1_001)).unwrap();
        let second = engine.export_state();
        prop_assert_eq!(first.bids, second.bids);
        prop_assert_eq!(first.asks, second.asks);
    }

    /// A delta and a trade that touch different levels commute; the strict
    /// per-update_id order of deltas themselves is asserted separately.
    #[test]
    fn delta_and_trade_commute_when_disjoint(
        delta_qty in 1i64..=40,
        trade_qty in 1i64..=4,
    ) {
        // Deep book so the trade never reaches the delta's level.
        let setup = UnifiedEvent {
            arrival_index: 0,
            payload: EventPayload::Snapshot(SnapshotRecord {
                origin_time: 1,
                bids: vec![Level::new(cents(9_999), units(5))],
                asks: vec![
                    Level::new(cents(10_001), units(5)),
                    Level::new(cents(10_002), units(5)),
                ],
            }),
        };
        let delta = UnifiedEvent {
            arrival_index: 1,
            payload: EventPayload::Delta(DeltaRecord {
                origin_time: 2,
                update_id: 1,
                side: BookSide::Bid,
                price: cents(9_998),
                new_quantity: units(delta_qty),
            }),
        };
        let trade = UnifiedEvent {
            arrival_index: 2,
            payload: EventPayload::Trade(TradeRecord {
                origin_time: 2,
                price: cents(10_001),
                quantity: units(trade_qty),
                side: Side::Buy,
                trade_id: None,
            }),
        };

        let mut ab = fresh_engine();
        ab.apply(setup.clone()).unwrap();
        ab.apply(delta.clone()).unwrap();
        ab.apply(trade.clone()).unwrap();

        let mut ba = fresh_engine();
        ba.apply(setup).unwrap();
        ba.apply(trade).unwrap();
        ba.apply(delta).unwrap();

        let a = ab.export_state();
        let b = ba.export_state();
        prop_assert_eq!(a.bids, b.bids);
        prop_assert_eq!(a.asks, b.asks);
    }

    /// The unifier is deterministic: identical per-source inputs produce
    /// byte-identical merged output.
    #[test]
    fn unifier_output_is_reproducible(
        trade_ts in prop::collection::vec(1_000i64..2_000, 0..30),
        delta_ts in prop::collection::vec(1_000i64..2_000, 0..30),
        snap_ts in prop::collection::vec(1_000i64..2_000, 0..10),
    ) {
        let sources = |mut trades: Vec<i64>, mut deltas: Vec<i64>, mut snaps: Vec<i64>| {
            trades.sort();
            deltas.sort();
            snaps.sort();
            let trades: Vec<EventPayload> = trades
                .into_iter()
                .map(|ts| EventPayload::Trade(TradeRecord {
                    origin_time: ts,
                    price: cents(10_000),
                    quantity: units(1),
                    side: Side::Buy,
                    trade_id: None,
                }))
                .collect();
            let deltas: Vec<EventPayload> = deltas
                .into_iter()
                .enumerate()
                .map(|(i, ts)| EventPayload::Delta(DeltaRecord {
                    origin_time: ts,
                    update_id: i as i64 + 1,
                    side: BookSide::Bid,
                    price: cents(9_999),
                    new_quantity: units(1),
                }))
                .collect();
            let snaps: Vec<EventPayload> = snaps
                .into_iter()
                .map(|ts| EventPayload::Snapshot(SnapshotRecord {
                    origin_time: ts,
                    bids: vec![],
                    asks: vec![],
                }))
                .collect();
            vec![snaps, deltas, trades]
        };

        let run = |src: Vec<Vec<EventPayload>>| -> Vec<UnifiedEvent> {
            let iters: Vec<_> = src.into_iter().map(|v| v.into_iter().map(Ok)).collect();
            Unifier::new(iters, OutOfOrderPolicy::Drop, Arc::new(Metrics::new()))
                .collect::<Result<Vec<_>>>()
                .unwrap()
        };

        let a = run(sources(trade_ts.clone(), delta_ts.clone(), snap_ts.clone()));
        let b = run(sources(trade_ts, delta_ts, snap_ts));
        prop_assert_eq!(bincode::serialize(&a).unwrap(), bincode::serialize(&b).unwrap());

        // And the merge is globally ordered by the event sort key.
        prop_assert!(a.windows(2).all(|w| w[0].sort_key() <= w[1].sort_key()));
    }

    /// decimal128 values survive format/parse and pips round-trips exactly.
    #[test]
    fn decimal_roundtrips_exactly(raw in any::<i64>()) {
        let d = Decimal::from_raw(raw as i128);
        let back: Decimal = d.to_string().parse().unwrap();
        prop_assert_eq!(d, back);

        // Values representable at 1e-8 round-trip through pips exactly.
        let codec = PipsCodec::new(8).unwrap();
        let coarse = Decimal::from_raw((raw as i128) * 10_000_000_000);
        let pips = codec.to_pips(coarse).unwrap();
        prop_assert_eq!(codec.from_pips(pips), coarse);
    }
}
