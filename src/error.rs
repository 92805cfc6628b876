//! Error taxonomy for the reconstruction pipeline.
//!
//! Non-fatal conditions (out-of-order input, duplicate deltas, sequence gaps,
//! snapshot drift, hidden liquidity) are *not* errors: they surface as typed
//! annotations on the event stream and as counters in
//! [`crate::metrics::Metrics`]. Only the conditions below terminate a worker.

use crate::decimal::DecimalError;
use std::path::PathBuf;

/// A helper Result type.
pub type Result<T> = std::result::Result<T, RlxError>;

/// Exit code for a clean run.
pub const EXIT_OK: i32 = 0;
/// Exit code for configuration errors.
pub const EXIT_CONFIG: i32 = 1;
/// Exit code for unrecoverable data errors.
pub const EXIT_DATA: i32 = 2;
/// Exit code for persistent I/O faults.
pub const EXIT_IO: i32 = 3;
/// Exit code after a graceful interrupt.
pub const EXIT_INTERRUPT: i32 = 130;

/// Fatal faults a worker (or the whole run) can die of.
#[derive(Debug, thiserror::Error)]
pub enum RlxError {
    /// Invalid parameters; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A file's schema is missing required columns or carries wrong types.
    #[error("schema error in {path}: {detail}")]
    Schema { path: PathBuf, detail: String },

    /// A frame or row group could not be decoded.
    #[error("decode error in {path}: {detail}")]
    Decode { path: PathBuf, detail: String },

    /// The pending queue filled before the first snapshot arrived.
    #[error("pending queue overflow before first snapshot ({buffered} events buffered)")]
    InitializationOverflow { buffered: usize },

    /// Decimal range or arithmetic overflow.
    #[error(transparent)]
    Overflow(#[from] DecimalError),

    /// Persistent I/O fault (transient faults are retried before this
    /// surfaces).
    #[error("I/O fault: {0}")]
    Io(#[from] std::io::Error),

    /// WAL checksum or framing failure; operator intervention required.
    #[error("corrupt WAL segment {path}: {detail}")]
    CorruptWal { path: PathBuf, detail: String },

    /// Checkpoint checksum or framing failure; operator intervention
    /// required.
    #[error("corrupt checkpoint {path}: {detail}")]
    CorruptCheckpoint { path: PathBuf, detail: String },
}

impl RlxError {
    /// Map a fault to the process exit code contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            RlxError::Config(_) => EXIT_CONFIG,
            RlxError::Io(_) => EXIT_IO,
            RlxError::Schema { .. }
            | RlxError::Decode { .. }
            | RlxError::InitializationOverflow { .. }
            | RlxError::Overflow(_)
            | RlxError::CorruptWal { .. }
            | RlxError::CorruptCheckpoint { .. } => EXIT_DATA,
        }
    }

    /// Whether a fresh attempt could plausibly succeed (used by the reader
    /// retry loop).
    pub fn is_transient_io(&self) -> bool {
        matches!(self, RlxError::Io(e) if matches!(
            e.kind(),
            std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(RlxError::Config("x".into()).exit_code(), EXIT_CONFIG);
        assert_eq!(
            RlxError::Io(std::io::Error::other("boom")).exit_code(),
            EXIT_IO
        );
        assert_eq!(
            RlxError::CorruptWal {
                path: "w".into(),
                detail: "crc".into()
            }
            .exit_code(),
            EXIT_DATA
        );
        assert_eq!(
            RlxError::InitializationOverflow { buffered: 4096 }.exit_code(),
            EXIT_DATA
        );
    }
}
