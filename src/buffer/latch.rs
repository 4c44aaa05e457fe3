//! Frame claim (latch) timeouts.
//!
//! The donor has no timed-lock primitive — its unsafe `BufferPool`
//! singleton never blocks a claim — but spec §5 requires `wwDependency`
//! and buffer-pool latch waits to honour an explicit timeout. `std::sync`
//! has no `try_lock_for`, so this engine reaches for `parking_lot`
//! (already used for exactly this in the harborgrid-justin-rusty-db
//! example repo) instead of hand-rolling a condvar-based timed lock.

use std::time::Duration;

pub const DEFAULT_LATCH_TIMEOUT: Duration = Duration::from_secs(30);
