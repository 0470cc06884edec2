/// Desired and ready replicas reported by one pool workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicasInfo {
    pub replicas: u32,
    pub ready_replicas: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub observed_generation: i64,
    pub replicas_info: ReplicasInfo,
    /// Raw patch last applied to the workload, read from its annotation.
    pub patch_info: Option<String>,
}

/// Read model over one live pool workload. Rebuilt from the workload on
/// every listing, never stored.
#[derive(Debug, Clone)]
pub struct Pool<O> {
    pub name: String,
    pub namespace: String,
    pub pool_ref: O,
    pub status: PoolStatus,
}
