use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use rlx_replay::config::{OutOfOrderPolicy, ReplayConfig};
use rlx_replay::error::{EXIT_CONFIG, EXIT_INTERRUPT, EXIT_OK, RlxError};
use rlx_replay::metrics::Metrics;
use rlx_replay::supervisor::{self, RunRequest};
use rlx_replay::{analyze, recover};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Historical L2 market-data reconstruction engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Summarize origin_time reliability and delta-gap census, recommend a
    /// reconstruction strategy
    Analyze {
        /// Input root containing trades/, book/ and book_delta_v2/
        #[arg(env = "RLX_DATA_ROOT")]
        input_root: PathBuf,

        /// Symbols to analyze (default: every symbol found)
        #[arg(long = "symbol")]
        symbols: Vec<String>,
    },

    /// Reconstruct the enriched event stream for one or more symbols
    Replay {
        /// Symbols to replay (one worker each)
        #[arg(long = "symbol", required = true)]
        symbols: Vec<String>,

        /// Window start, RFC 3339 (e.g. 2024-03-02T00:00:00Z)
        #[arg(long)]
        from: String,

        /// Window end, RFC 3339, exclusive
        #[arg(long)]
        to: String,

        /// Input root
        #[arg(long = "in", env = "RLX_DATA_ROOT")]
        input: PathBuf,

        /// Output root
        #[arg(long = "out", env = "RLX_OUT_ROOT")]
        out: PathBuf,

        #[arg(long, default_value_t = 1_000_000)]
        checkpoint_every_events: u64,

        #[arg(long, default_value_t = 60)]
        checkpoint_every_seconds: u64,

        #[arg(long, default_value_t = 1_000)]
        batch_size: usize,

        /// Concurrent symbol workers (0 = one per symbol)
        #[arg(long, default_value_t = 0)]
        workers: usize,

        /// Policy for origin_time regressions within a source (drop|carry)
        #[arg(long, default_value = "drop")]
        out_of_order: OutOfOrderPolicy,

        /// Let trades consume tracked liquidity beyond the top levels
        #[arg(long, default_value_t = false)]
        consume_overflow_on_trade: bool,

        /// Seconds to wait for draining workers on shutdown
        #[arg(long, default_value_t = 30)]
        drain_deadline_seconds: u64,
    },

    /// Force recovery for a symbol without consuming new input
    /// (re-emit WAL backlog, finalize partitions, truncate the log)
    Recover {
        #[arg(long = "symbol", required = true)]
        symbols: Vec<String>,

        #[arg(long = "out", env = "RLX_OUT_ROOT")]
        out: PathBuf,
    },
}

fn parse_iso_ns(s: &str) -> Result<i64, RlxError> {
    OffsetDateTime::parse(s, &Rfc3339)
        .map(|dt| dt.unix_timestamp_nanos() as i64)
        .map_err(|e| RlxError::Config(format!("invalid timestamp {s:?}: {e}")))
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_env("RLX_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_new("info"))
        .context("build log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

fn install_shutdown_handler() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || {
        if handler_flag.swap(true, Ordering::SeqCst) {
            // Second signal: the operator means it.
            std::process::exit(EXIT_INTERRUPT);
        }
        eprintln!("interrupt received, draining workers (ctrl-c again to force quit)");
    })
    .context("install ctrl-c handler")?;
    Ok(flag)
}

fn run(cli: Cli) -> i32 {
    match cli.command {
        Command::Analyze {
            input_root,
            symbols,
        } => match analyze::run(&input_root, &symbols) {
            Ok(()) => EXIT_OK,
            Err(e) => {
                error!(error = %e, "analyze failed");
                e.exit_code()
            }
        },

        Command::Replay {
            symbols,
            from,
            to,
            input,
            out,
            checkpoint_every_events,
            checkpoint_every_seconds,
            batch_size,
            workers,
            out_of_order,
            consume_overflow_on_trade,
            drain_deadline_seconds,
        } => {
            let cfg = ReplayConfig {
                batch_size,
                checkpoint_every_events,
                checkpoint_every_seconds,
                out_of_order,
                consume_overflow_on_trade,
                drain_deadline_secs: drain_deadline_seconds,
                ..ReplayConfig::default()
            };
            let request = match build_request(symbols, &from, &to, input, out, workers, cfg) {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "invalid configuration");
                    return e.exit_code();
                }
            };
            let shutdown = match install_shutdown_handler() {
                Ok(f) => f,
                Err(e) => {
                    error!(error = %e, "startup failed");
                    return EXIT_CONFIG;
                }
            };
            info!(
                symbols = request.symbols.len(),
                from = %from,
                to = %to,
                "replay starting"
            );
            supervisor::run(request, shutdown)
        }

        Command::Recover { symbols, out } => {
            let cfg = ReplayConfig::default();
            let mut code = EXIT_OK;
            for symbol in &symbols {
                let metrics = Arc::new(Metrics::new());
                if let Err(e) = recover::finalize_symbol(&out, symbol, &cfg, &metrics) {
                    error!(symbol, error = %e, "recover failed");
                    code = code.max(e.exit_code());
                }
            }
            code
        }
    }
}

fn build_request(
    symbols: Vec<String>,
    from: &str,
    to: &str,
    data_root: PathBuf,
    out_root: PathBuf,
    workers: usize,
    cfg: ReplayConfig,
) -> Result<RunRequest, RlxError> {
    cfg.validate()?;
    let from_ns = parse_iso_ns(from)?;
    let to_ns = parse_iso_ns(to)?;
    if from_ns >= to_ns {
        return Err(RlxError::Config(format!(
            "--from {from} must be before --to {to}"
        )));
    }
    if !data_root.exists() {
        return Err(RlxError::Config(format!(
            "input root {} does not exist",
            data_root.display()
        )));
    }
    Ok(RunRequest {
        data_root,
        out_root,
        symbols,
        from_ns,
        to_ns,
        workers,
        cfg,
    })
}

fn main() {
    let _ = dotenv();
    let cli = Cli::parse();
    if let Err(e) = init_logging() {
        eprintln!("logging setup failed: {e:#}");
        std::process::exit(EXIT_CONFIG);
    }
    std::process::exit(run(cli));
}
