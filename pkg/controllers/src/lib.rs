//! Reconciliation of UnitedDeployments: one workload per topology pool,
//! driven from a shared template and a versioned revision history.

pub mod adapter;
pub mod batch;
pub mod claim;
pub mod events;
pub mod patch;
pub mod pool;
pub mod pool_control;
pub mod provision;
pub mod revision;
pub mod united;

#[cfg(test)]
pub(crate) mod testing;

pub use events::{EventRecorder, MemoryRecorder, StoreRecorder};
pub use united::{ControllerConfig, UnitedDeploymentController};
