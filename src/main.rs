//! clawbridge - Main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use clawbridge::{
    bridge::{BridgeState, ControlPlaneServer},
    cli::{Cli, Command, ServeArgs, run_sandbox_command},
    config::BridgeConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv(); // Load .env if present

    let args = match cli.command {
        Some(Command::Sandbox(cmd)) => {
            // Simple logging for one-shot commands
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
                )
                .init();
            return run_sandbox_command(cmd).await;
        }
        Some(Command::Serve(args)) => args,
        None => ServeArgs::default(),
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("clawbridge=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    serve(args).await
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = BridgeConfig::from_env()?;
    if let Some(state_dir) = args.state_dir {
        config = BridgeConfig {
            cli_bin: config.cli_bin,
            restart_delay: config.restart_delay,
            ..BridgeConfig::for_state_dir(config.bind, state_dir)
        };
    }
    if let Some(host) = args.host {
        config.bind.set_ip(host);
    }
    if let Some(port) = args.port {
        config.bind.set_port(port);
    }

    let state = BridgeState::from_config(&config);
    if state.store.ensure_initialized()? {
        tracing::info!(path = %config.config_path.display(), "Created empty config");
    }
    tracing::info!(
        state_dir = %config.state_dir().display(),
        cli = %config.cli_bin,
        "Starting control plane"
    );

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    ControlPlaneServer::serve(listener, Arc::new(state), async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown requested");
    })
    .await?;
    Ok(())
}
