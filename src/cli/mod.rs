//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the in-sandbox control plane (`serve`)
//! - Driving sandboxes from the orchestrator side (`sandbox provision`,
//!   `sandbox status`, `sandbox login`, `sandbox callback`)

mod sandbox;

pub use sandbox::{SandboxCommand, run_sandbox_command};

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "clawbridge")]
#[command(about = "Control-plane bridge between an orchestrator and sandboxed agent runtimes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the control-plane server inside a sandbox (default if no
    /// subcommand given)
    Serve(ServeArgs),

    /// Orchestrator-side sandbox operations
    #[command(subcommand)]
    Sandbox(SandboxCommand),
}

/// Overrides for the environment-derived bridge settings.
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Runtime state directory (config, auth profiles, sessions)
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}
