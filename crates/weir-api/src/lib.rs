//! Data model and client facade for the weir orchestration API.
//!
//! This crate defines the records the execution core exchanges with the
//! state-management backend (states, task runs, flow runs, deployments),
//! the [`client::OrchestrationClient`] trait the core consumes, an
//! in-memory [`memory::EphemeralOrchestrator`] backend used when no API
//! URL is configured, and the local result store.

pub mod client;
pub mod filters;
pub mod memory;
pub mod models;
pub mod storage;
