//! State store constants.

/// Root prefix of every object key: `/registry/<plural>/<namespace>/<name>`.
pub const REGISTRY_PREFIX: &str = "/registry";

/// Length of the random suffix appended to `generateName`.
pub const GENERATED_NAME_SUFFIX_LEN: usize = 5;

/// Attempts to find a free generated name before giving up.
pub const GENERATED_NAME_ATTEMPTS: usize = 8;

/// Default per-request deadline for object store calls, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
