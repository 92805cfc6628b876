//! Market-data reconstruction engine library.
//!
//! This crate turns historical exchange records (trades, periodic L2
//! snapshots, differential book updates) into a single chronologically
//! ordered, stateful event stream annotated with the order-book state after
//! each event:
//!
//! - `decimal`: fixed-scale (10^-18) i128 decimal and pips codec
//! - `event`: raw records, unified events, enriched events, ordering keys
//! - `columnar`: CRC-framed row-group columnar container (inputs + output)
//! - `ingest`: partition discovery and micro-batch readers
//! - `unify`: stable k-way chronological merge
//! - `book`: the stateful L2 order-book engine
//! - `wal` / `checkpoint`: durability (append-only log, engine snapshots)
//! - `sink`: hourly partitioned output with an atomically updated manifest
//! - `replay` / `recover`: the replay loop and crash recovery
//! - `supervisor`: per-symbol workers, routing, backpressure, shutdown
//! - `analyze`: input reliability reports
//!
//! The `rlx-replay` binary (`src/main.rs`) wires these modules behind the
//! `analyze`, `replay` and `recover` subcommands. All durable files share
//! the same framing (`[len:u32][crc32:u32][payload]`) with CRC integrity
//! checks on every read path.
pub mod analyze;
pub mod book;
pub mod checkpoint;
pub mod columnar;
pub mod config;
pub mod decimal;
pub mod error;
pub mod event;
pub mod ingest;
pub mod metrics;
pub mod recover;
pub mod replay;
pub mod sink;
pub mod supervisor;
pub mod unify;
pub mod wal;
