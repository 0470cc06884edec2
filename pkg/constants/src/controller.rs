//! UnitedDeployment controller defaults.

/// Revisions kept when `spec.revisionHistoryLimit` is unset.
pub const DEFAULT_REVISION_HISTORY_LIMIT: u32 = 10;

/// Size of the first batch in a slow-start batch.
pub const SLOW_START_INITIAL_BATCH_SIZE: usize = 1;

/// Attempts made by `PoolControl::update_pool` before surfacing the error.
pub const POOL_UPDATE_RETRIES: usize = 5;

/// Attempts made when writing the resource status back.
pub const STATUS_UPDATE_RETRIES: usize = 5;

/// Name collisions tolerated while creating one revision.
pub const MAX_REVISION_NAME_COLLISIONS: u32 = 100;

/// Default resync interval of the controller loop, in seconds.
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 10;

/// Default number of resources reconciled in parallel.
pub const DEFAULT_CONCURRENT_RECONCILES: usize = 4;

/// Longest allowed revision name prefix, leaving room for the hash suffix.
pub const MAX_REVISION_NAME_PREFIX_LEN: usize = 223;

/// Default namespace used when a manifest omits one.
pub const DEFAULT_NAMESPACE: &str = "default";
