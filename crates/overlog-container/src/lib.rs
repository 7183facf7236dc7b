//! overlog container - Shared container lifecycle
//!
//! This crate drives the base log engine to create, open and delete
//! shared containers with crash-safe naming, and keeps each container's
//! stream directory in step with it.

pub mod engine;
pub mod lifecycle;

pub use engine::{BaseContainer, LogEngine};
pub use lifecycle::{
    ContainerLifecycleOrchestrator, ContainerLocation, DeleteSummary, SharedContainer,
};
