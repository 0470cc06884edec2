//! Object model shared by the store, the controllers and the binaries.

pub mod condition;
pub mod config;
pub mod deployment;
pub mod event;
pub mod meta;
pub mod pod;
pub mod registry;
pub mod revision;
pub mod selector;
pub mod statefulset;
pub mod united;
pub mod validate;
