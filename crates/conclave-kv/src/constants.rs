//! Resource bounds for store backends.

/// Number of past change events the in-memory store keeps for watch replay.
pub const MAX_WATCH_HISTORY: usize = 4096;

/// Capacity of the in-memory change broadcast. Slower watchers get `WatchLagged`.
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Smallest TTL a lease can be granted with.
pub const MIN_LEASE_TTL_SECS: u64 = 1;
