//! oscfg-agent - the host agent composition layer.
//!
//! Wires oscfg-core's building blocks into the running agent: the
//! agent-endpoint client (registration, inventory upload, task-notification
//! stream), the task executor, the service loop with its periodic
//! supervisor, and the metrics listener. The binary in `main.rs` selects a
//! run mode and hands control to [`service::run_service_loop`].

pub mod cleanup;
pub mod executor;
pub mod metrics;
pub mod rpc;
pub mod service;
