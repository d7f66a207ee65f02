//! Orchestrator-side sandbox commands.

use std::sync::Arc;

use clap::Subcommand;

use crate::config::{OrchestratorConfig, SandboxSecrets};
use crate::orchestrator::{Coordinator, DockerRuntime, LifecycleConfig};

#[derive(Subcommand, Debug, Clone)]
pub enum SandboxCommand {
    /// Wait for a container, fix ownership and inject credentials from the
    /// environment
    Provision {
        /// Container id or name
        container: String,
    },

    /// Show bridge status, or container state when the bridge is down
    Status {
        /// Container id or name
        container: String,
    },

    /// Start an OAuth login and print the authorization URL
    Login {
        /// Container id or name
        container: String,
        /// Provider to log in to
        provider: String,
    },

    /// Finish an OAuth login with the browser's redirect URL
    Callback {
        /// Container id or name
        container: String,
        /// Provider the login was started for
        provider: String,
        /// Full redirect URL from the browser
        url: String,
    },
}

/// Run a sandbox command against the local Docker daemon.
pub async fn run_sandbox_command(cmd: SandboxCommand) -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env()?;
    let coordinator = Coordinator::new(
        Arc::new(DockerRuntime::new()),
        LifecycleConfig::from(&config),
    );

    match cmd {
        SandboxCommand::Provision { container } => {
            let secrets = SandboxSecrets::from_env()?;
            let report = coordinator.provision(&container, &secrets).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        SandboxCommand::Status { container } => {
            let status = coordinator.sandbox_status(&container).await?;
            if status.is_degraded() {
                eprintln!("warning: control plane unreachable, showing container state");
            }
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        SandboxCommand::Login {
            container,
            provider,
        } => {
            let url = coordinator.start_login(&container, &provider).await?;
            println!("Open this URL to continue the {} login:\n\n  {}\n", provider, url);
            println!(
                "Then run: clawbridge sandbox callback {} {} '<redirect url>'",
                container, provider
            );
        }
        SandboxCommand::Callback {
            container,
            provider,
            url,
        } => {
            let done = coordinator
                .submit_callback(&container, &provider, &url)
                .await?;
            println!("Login for {} complete.", done.provider);
            if !done.output.trim().is_empty() {
                println!("{}", done.output.trim());
            }
        }
    }

    Ok(())
}
