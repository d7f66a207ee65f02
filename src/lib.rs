//! clawbridge: control plane between an orchestrator and sandboxed agent
//! runtimes.
//!
//! Inside each sandbox, [`bridge::ControlPlaneServer`] owns the runtime's
//! config and credential files, wraps its CLI and drives interactive OAuth
//! logins. On the orchestrator, [`orchestrator::Coordinator`] brings new
//! containers up and pushes credentials in through that server.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod merge;
pub mod oauth;
pub mod orchestrator;
pub mod store;

pub use config::{BridgeConfig, OrchestratorConfig, SandboxSecrets};
