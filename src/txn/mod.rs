//! Transaction Index (spec §4.G): timestamp allocation, per-transaction
//! status tracking, MVCC visibility resolution, and ww-dependency
//! deadlock detection.

pub mod index;
pub mod status;
pub mod timestamp;
pub mod wait_for_graph;

pub use index::{ActiveTransactionCache, TransactionIndex};
pub use status::{Step, TransactionStatus, VersionHandle, ABORTED, UNCOMMITTED};
pub use timestamp::{Timestamp, TimestampAllocator, TS_ZERO};
