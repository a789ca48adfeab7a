//! profiler-collector: accepts profiler agents over TCP, keeps a registry of
//! connected pods, and serves collector state over a local HTTP API.

pub mod api;
pub mod listener;
pub mod registry;

pub use api::ApiState;
pub use listener::CollectorListener;
pub use registry::{PodEntry, PodRegistry, RegistrySink, RegistryStats};
