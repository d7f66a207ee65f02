//! Orchestrator side of the bridge.
//!
//! ```text
//! Coordinator ──► ContainerRuntime (bollard)   wait, chown, legacy exec
//!      │
//!      └────────► BridgeClient ──HTTP──► sandbox control plane
//! ```

pub mod client;
pub mod lifecycle;
pub mod project;
pub mod runtime;

pub use client::{BridgeClient, RetryPolicy};
pub use lifecycle::{
    Coordinator, LifecycleConfig, ProvisionPath, ProvisionReport, SandboxStatus,
};
pub use project::{
    InMemoryProjectRepository, MaskedProject, Project, ProjectRepository, mask_credential,
};
pub use runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, DockerRuntime, ExecOutput, ExecSpec,
};
