//! Label and annotation keys stamped onto objects produced by the controller.
//!
//! These keys are persisted on live objects; changing them orphans every
//! pool created by an older build.

/// Label carrying the pool name on every pool workload and its pod template.
pub const POOL_NAME_LABEL: &str = "apps.udm.dev/pool-name";

/// Label carrying the revision name a pool workload (and its pods) was built from.
pub const REVISION_HASH_LABEL: &str = "apps.udm.dev/controller-revision-hash";

/// Annotation holding the raw patch last applied to a pool workload.
pub const PATCH_ANNOTATION: &str = "apps.udm.dev/patch";

/// Label on `ControllerRevision` objects holding the content hash.
pub const CONTROLLER_REVISION_HASH_LABEL: &str = "controller.kubernetes.io/hash";
