//! Multi-symbol supervision.
//!
//! One worker per symbol, each an isolated failure domain owning its engine,
//! WAL, checkpoints and sink subtree. Inside a worker the pipeline runs on a
//! small fixed set of threads: three source readers feeding bounded channels
//! and the replay thread doing unify -> engine -> WAL -> sink. Channel sends
//! block when full, so a slow consumer backpressures the readers
//! deterministically; records are never dropped on overflow.
//!
//! Shutdown is two-phase: the ctrl-c handler flips a shared flag, workers
//! finish their current batch and drain (final flush + WAL rotate + covering
//! checkpoint), and the supervisor waits up to the drain deadline before
//! abandoning stragglers. Worker faults surface as non-zero exit codes; no
//! automatic retry, so data issues are never masked.

use crate::book::OrderBookEngine;
use crate::checkpoint::CheckpointStore;
use crate::config::ReplayConfig;
use crate::error::{EXIT_INTERRUPT, EXIT_OK, Result};
use crate::event::EventType;
use crate::ingest::{discover_partitions, run_reader, table_for};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::recover::recover_worker;
use crate::replay::Replayer;
use crate::sink::Sink;
use crate::unify::{ChannelFeed, Unifier};
use crate::wal::Wal;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Everything the `replay` subcommand resolved from CLI + environment.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub data_root: PathBuf,
    pub out_root: PathBuf,
    pub symbols: Vec<String>,
    pub from_ns: i64,
    pub to_ns: i64,
    pub workers: usize,
    pub cfg: ReplayConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
enum WorkerState {
    Pending,
    Running,
    Done,
    Interrupted,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
struct WorkerHealth {
    state: WorkerState,
    exit_code: i32,
}

#[derive(Serialize)]
struct StatusFile<'a> {
    workers: &'a BTreeMap<String, WorkerHealth>,
    metrics: BTreeMap<String, MetricsSnapshot>,
}

/// Run one symbol's full pipeline to completion. Returns whether the worker
/// stopped on the shutdown signal.
fn run_worker(
    req: &RunRequest,
    symbol: &str,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
) -> Result<bool> {
    let symbol_dir = req.out_root.join(symbol);
    let mut sink = Sink::open(&req.out_root, symbol, &req.cfg, metrics.clone())?;
    let recovery = recover_worker(&symbol_dir, &metrics, &mut sink)?;
    let engine = match &recovery.checkpoint {
        Some(cp) => {
            sink.set_checkpoint_id(cp.id);
            OrderBookEngine::restore(&req.cfg, metrics.clone(), cp.book.clone())
        }
        None => OrderBookEngine::new(&req.cfg, metrics.clone()),
    };
    let wal = Wal::open(
        &symbol_dir.join("wal"),
        symbol,
        &req.cfg,
        metrics.clone(),
        recovery.next_wal_seq,
        recovery.last_checkpoint_id,
    )?;
    let checkpoints = CheckpointStore::open(&symbol_dir.join("checkpoints"), metrics.clone())?;

    // Channel capacity is sized in records and converted to micro-batches,
    // which keeps reader residency at O(capacity x row width).
    let batch_capacity = req.cfg.channel_capacity.div_ceil(req.cfg.batch_size).max(1);
    let mut feeds = Vec::new();
    let mut readers = Vec::new();
    for kind in [EventType::BookSnapshot, EventType::BookDelta, EventType::Trade] {
        let (table, _) = table_for(kind);
        let files = discover_partitions(&req.data_root, table, symbol, req.from_ns, req.to_ns)?;
        info!(symbol, table, files = files.len(), "source discovered");
        let (tx, rx) = crossbeam_channel::bounded(batch_capacity);
        let cfg = req.cfg.clone();
        let reader_metrics = metrics.clone();
        let (from_ns, to_ns) = (req.from_ns, req.to_ns);
        let handle = std::thread::Builder::new()
            .name(format!("{symbol}-{table}"))
            .spawn(move || {
                run_reader(kind, &files, from_ns, to_ns, &cfg, &reader_metrics, &tx);
            })?;
        readers.push(handle);
        feeds.push(ChannelFeed::new(rx));
    }

    let unifier = Unifier::new(feeds, req.cfg.out_of_order, metrics.clone());
    let mut replayer = Replayer::new(
        req.cfg.clone(),
        symbol.to_string(),
        engine,
        wal,
        sink,
        checkpoints,
        metrics,
        shutdown,
        recovery.resume,
    );
    let result = replayer.run(unifier);
    // The unifier (and with it every receiver) is gone, so blocked readers
    // unblock and exit.
    for handle in readers {
        let _ = handle.join();
    }
    result?;
    Ok(replayer.interrupted())
}

/// Spawn workers for every requested symbol, with at most `workers` running
/// at once, and supervise them until completion or forced shutdown.
///
/// Returns the process exit code.
pub fn run(req: RunRequest, shutdown: Arc<AtomicBool>) -> i32 {
    let slots = if req.workers == 0 {
        req.symbols.len().max(1)
    } else {
        req.workers.min(req.symbols.len().max(1))
    };
    let queue: Arc<Mutex<VecDeque<String>>> =
        Arc::new(Mutex::new(req.symbols.iter().cloned().collect()));
    let health: Arc<Mutex<BTreeMap<String, WorkerHealth>>> = Arc::new(Mutex::new(
        req.symbols
            .iter()
            .map(|s| {
                (
                    s.clone(),
                    WorkerHealth {
                        state: WorkerState::Pending,
                        exit_code: EXIT_OK,
                    },
                )
            })
            .collect(),
    ));
    let metrics: BTreeMap<String, Arc<Metrics>> = req
        .symbols
        .iter()
        .map(|s| (s.clone(), Arc::new(Metrics::new())))
        .collect();

    let req = Arc::new(req);
    let mut slot_handles = Vec::new();
    for slot in 0..slots {
        let req = req.clone();
        let queue = queue.clone();
        let health = health.clone();
        let shutdown = shutdown.clone();
        let metrics = metrics.clone();
        let handle = std::thread::Builder::new()
            .name(format!("worker-slot-{slot}"))
            .spawn(move || {
                loop {
                    // Checked before taking a symbol: a pop after the
                    // signal would strand that symbol in Pending.
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let Some(symbol) = queue.lock().expect("queue poisoned").pop_front() else {
                        break;
                    };
                    set_state(&health, &symbol, WorkerState::Running, EXIT_OK);
                    let worker_metrics = metrics[&symbol].clone();
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        run_worker(&req, &symbol, worker_metrics, shutdown.clone())
                    }));
                    match outcome {
                        Ok(Ok(false)) => {
                            set_state(&health, &symbol, WorkerState::Done, EXIT_OK)
                        }
                        Ok(Ok(true)) => {
                            set_state(&health, &symbol, WorkerState::Interrupted, EXIT_INTERRUPT)
                        }
                        Ok(Err(e)) => {
                            error!(symbol, error = %e, "worker failed");
                            set_state(&health, &symbol, WorkerState::Failed, e.exit_code());
                        }
                        Err(_) => {
                            error!(symbol, "worker panicked");
                            set_state(
                                &health,
                                &symbol,
                                WorkerState::Failed,
                                crate::error::EXIT_DATA,
                            );
                        }
                    }
                }
            })
            .expect("spawn worker slot");
        slot_handles.push(handle);
    }

    // Supervision loop: refresh the metrics endpoint, enforce the drain
    // deadline after a shutdown signal.
    let metrics_path = req.out_root.join("metrics.json");
    let mut shutdown_seen: Option<Instant> = None;
    loop {
        let all_done = slot_handles.iter().all(|h| h.is_finished());
        write_status(&metrics_path, &health, &metrics);
        if all_done {
            break;
        }
        if shutdown.load(Ordering::Relaxed) {
            let since = shutdown_seen.get_or_insert_with(Instant::now);
            if since.elapsed().as_secs() >= req.cfg.drain_deadline_secs {
                warn!("drain deadline exceeded, abandoning remaining workers");
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    let abandoned = !slot_handles.iter().all(|h| h.is_finished());
    if !abandoned {
        for handle in slot_handles {
            let _ = handle.join();
        }
    }
    write_status(&metrics_path, &health, &metrics);

    // End-of-run summary, one rollup block per symbol.
    for (symbol, m) in &metrics {
        let snap = m.snapshot();
        if snap.events_applied == 0 && snap.recovered_events == 0 {
            continue;
        }
        info!(symbol, "run summary");
        for line in snap.summary_lines() {
            info!(symbol, "  {line}");
        }
    }

    let health = health.lock().expect("health poisoned");
    let mut code = EXIT_OK;
    for h in health.values() {
        if h.state == WorkerState::Failed {
            code = code.max(h.exit_code);
        }
    }
    // A symbol still Pending after every slot stopped was never attempted:
    // the run did not cover the request, which is an interrupt, not a clean
    // exit.
    if code == EXIT_OK
        && (abandoned
            || health.values().any(|h| {
                matches!(h.state, WorkerState::Interrupted | WorkerState::Pending)
            }))
    {
        code = EXIT_INTERRUPT;
    }
    code
}

fn set_state(
    health: &Arc<Mutex<BTreeMap<String, WorkerHealth>>>,
    symbol: &str,
    state: WorkerState,
    exit_code: i32,
) {
    if let Some(h) = health.lock().expect("health poisoned").get_mut(symbol) {
        h.state = state;
        h.exit_code = exit_code;
    }
}

fn write_status(
    path: &std::path::Path,
    health: &Arc<Mutex<BTreeMap<String, WorkerHealth>>>,
    metrics: &BTreeMap<String, Arc<Metrics>>,
) {
    let health = health.lock().expect("health poisoned");
    let status = StatusFile {
        workers: &*health,
        metrics: metrics
            .iter()
            .map(|(s, m)| (s.clone(), m.snapshot()))
            .collect(),
    };
    if let Ok(bytes) = serde_json::to_vec_pretty(&status) {
        let tmp = path.with_extension("json.tmp");
        if std::fs::write(&tmp, bytes).is_ok() {
            let _ = std::fs::rename(&tmp, path);
        }
    }
}
