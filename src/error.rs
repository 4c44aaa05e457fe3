use std::fmt;
use std::io;

/// The engine's single error type.
///
/// Mirrors the error kinds enumerated in the design: corruption and I/O
/// failures are always surfaced to the caller; `Retry` and `Rollback` are
/// expected to be handled locally by a bounded retry loop.
#[derive(Debug)]
pub enum EngineError {
    CorruptVolume(String),
    CorruptJournal(String),
    CorruptValue(String),
    IoFailed { op: &'static str, source: io::Error },
    InUse { timeout_ms: u64 },
    InvalidKey(String),
    KeyTooLong { len: usize, max: usize },
    ValueTooLong { len: usize, max: usize },
    TreeNotFound(String),
    VolumeNotFound(String),
    Interrupted,
    ReadOnly,
    Rollback,
    Retry,
    Config(String),
}

impl EngineError {
    pub fn io(op: &'static str, source: io::Error) -> Self {
        EngineError::IoFailed { op, source }
    }

    /// True for the kinds a background worker should log and continue past
    /// rather than propagate as a fatal condition.
    pub fn is_recoverable_locally(&self) -> bool {
        matches!(self, EngineError::Retry | EngineError::Rollback)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::CorruptVolume(msg) => write!(f, "corrupt volume: {}", msg),
            EngineError::CorruptJournal(msg) => write!(f, "corrupt journal: {}", msg),
            EngineError::CorruptValue(msg) => write!(f, "corrupt value: {}", msg),
            EngineError::IoFailed { op, source } => write!(f, "io failed ({}): {}", op, source),
            EngineError::InUse { timeout_ms } => {
                write!(f, "latch not acquired within {}ms", timeout_ms)
            }
            EngineError::InvalidKey(msg) => write!(f, "invalid key: {}", msg),
            EngineError::KeyTooLong { len, max } => {
                write!(f, "key too long: {} > {}", len, max)
            }
            EngineError::ValueTooLong { len, max } => {
                write!(f, "value too long: {} > {}", len, max)
            }
            EngineError::TreeNotFound(name) => write!(f, "tree not found: {}", name),
            EngineError::VolumeNotFound(name) => write!(f, "volume not found: {}", name),
            EngineError::Interrupted => write!(f, "operation interrupted"),
            EngineError::ReadOnly => write!(f, "volume is read-only"),
            EngineError::Rollback => write!(f, "transaction must restart from begin"),
            EngineError::Retry => write!(f, "internal retry requested"),
            EngineError::Config(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<io::Error> for EngineError {
    fn from(source: io::Error) -> Self {
        EngineError::IoFailed { op: "io", source }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
