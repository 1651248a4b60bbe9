use std::time::Duration;

/// Upper bound of a single background cache read.
pub const CACHE_CHUNK_LEN: usize = 64 * 1024;

/// Interval at which the throughput counters are resampled.
pub const TICK: Duration = Duration::from_secs(1);

/// Identifies one in-flight transfer inside the multi engine.
pub type TransferId = u64;
