//! Defaults and bounds for the coordination layer.

/// Key-space root used when none is configured.
pub const DEFAULT_PREFIX: &str = "/conclave/sync";

/// Store endpoint used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";

/// Namespace used by elections, listings and watchers when none is given.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Session lease lifetime used when none is given.
pub const DEFAULT_TTL_SECS: u64 = 30;

/// Lower bound between two keep-alive requests.
pub const MIN_KEEP_ALIVE_INTERVAL_MS: u64 = 100;

/// Buffered leadership notifications per `observe()` receiver.
pub const OBSERVE_CHANNEL_CAPACITY: usize = 16;

/// First delay before retrying a campaign that failed on a store error.
pub const CAMPAIGN_RETRY_INITIAL_BACKOFF_MS: u64 = 50;

/// Upper bound on the campaign retry delay.
pub const CAMPAIGN_RETRY_MAX_BACKOFF_MS: u64 = 2_000;
