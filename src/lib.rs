pub mod accumulator;
pub mod alert;
pub mod buffer;
pub mod cleanup;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod journal;
pub mod mvv;
pub mod page;
pub mod tree;
pub mod txn;
pub mod volume;

pub use accumulator::{Accumulator, AccumulatorKind, AccumulatorState};
pub use config::{BufferPoolSpec, CommitPolicy, EngineConfig, VolumeOpenMode, VolumeSpec};
pub use engine::{Engine, TxnHandle};
pub use error::{EngineError, EngineResult};

