//! Chronological unification of the three per-source streams.
//!
//! A k-way merge over tagged source iterators, keyed on the total order of
//! [`SortKey`]: (`origin_time`, source priority, `update_id`,
//! `arrival_index`). Each source yields a single event kind and its events
//! get a stable per-source arrival index, so the key is unique and the merge
//! is deterministic and reproducible across runs on identical inputs.
//!
//! Per-source `origin_time` regressions surface as `OutOfOrderWarning`; the
//! default policy drops the offending record with a sampled log line, the
//! `carry` policy forwards it at its (late) merge position.

use crate::config::OutOfOrderPolicy;
use crate::error::Result;
use crate::event::{EventPayload, SortKey, UnifiedEvent};
use crate::metrics::{Metrics, sampled};
use crossbeam_channel::Receiver;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

/// One micro-batch of decoded events from a single source, in source order.
pub type SourceBatch = Vec<EventPayload>;

/// Adapter turning a reader channel into a per-source event iterator.
/// Blocks on `recv`, which is what couples the unifier to reader
/// backpressure.
pub struct ChannelFeed {
    rx: Receiver<Result<SourceBatch>>,
    buf: VecDeque<EventPayload>,
    done: bool,
}

impl ChannelFeed {
    pub fn new(rx: Receiver<Result<SourceBatch>>) -> Self {
        ChannelFeed {
            rx,
            buf: VecDeque::new(),
            done: false,
        }
    }
}

impl Iterator for ChannelFeed {
    type Item = Result<EventPayload>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(ev) = self.buf.pop_front() {
                return Some(Ok(ev));
            }
            if self.done {
                return None;
            }
            match self.rx.recv() {
                Ok(Ok(batch)) => self.buf.extend(batch),
                Ok(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Err(_) => {
                    // Sender dropped: source exhausted.
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

struct SourceState<I> {
    iter: I,
    arrival: u64,
    last_origin_time: i64,
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    key: SortKey,
    source: usize,
    event: UnifiedEvent,
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key).then(self.source.cmp(&other.source))
    }
}

/// The k-way merge itself.
pub struct Unifier<I> {
    sources: Vec<SourceState<I>>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    policy: OutOfOrderPolicy,
    metrics: Arc<Metrics>,
    primed: bool,
}

impl<I> Unifier<I>
where
    I: Iterator<Item = Result<EventPayload>>,
{
    pub fn new(sources: Vec<I>, policy: OutOfOrderPolicy, metrics: Arc<Metrics>) -> Self {
        Unifier {
            sources: sources
                .into_iter()
                .map(|iter| SourceState {
                    iter,
                    arrival: 0,
                    last_origin_time: i64::MIN,
                })
                .collect(),
            heap: BinaryHeap::new(),
            policy,
            metrics,
            primed: false,
        }
    }

    /// Pull the next in-order event from `source`, applying the out-of-order
    /// policy, and stage it on the heap.
    fn refill(&mut self, source: usize) -> Result<()> {
        loop {
            let state = &mut self.sources[source];
            let Some(item) = state.iter.next() else {
                return Ok(());
            };
            let payload = item?;
            let ts = payload.origin_time();
            if ts < state.last_origin_time {
                let n = Metrics::bump(&self.metrics.out_of_order);
                if sampled(n) {
                    warn!(
                        origin_time = ts,
                        last = state.last_origin_time,
                        kind = payload.event_type().label(),
                        "out-of-order record within source"
                    );
                }
                if matches!(self.policy, OutOfOrderPolicy::Drop) {
                    continue;
                }
            } else {
                state.last_origin_time = ts;
            }
            let event = UnifiedEvent {
                arrival_index: state.arrival,
                payload,
            };
            state.arrival += 1;
            let key = event.sort_key();
            self.heap.push(Reverse(HeapEntry { key, source, event }));
            return Ok(());
        }
    }
}

impl<I> Iterator for Unifier<I>
where
    I: Iterator<Item = Result<EventPayload>>,
{
    type Item = Result<UnifiedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.primed {
            self.primed = true;
            for i in 0..self.sources.len() {
                if let Err(e) = self.refill(i) {
                    return Some(Err(e));
                }
            }
        }
        let Reverse(entry) = self.heap.pop()?;
        if let Err(e) = self.refill(entry.source) {
            return Some(Err(e));
        }
        Some(Ok(entry.event))
    }
}
