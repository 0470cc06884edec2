pub mod client;
pub mod error;
pub mod objects;

pub use client::StateStore;
pub use error::StoreError;
pub use objects::{Client, ObjectBackend, PropagationPolicy, StoreBackend};
