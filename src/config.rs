//! Configuration for clawbridge.
//!
//! Everything comes from the environment (optionally via a `.env` file).
//! The sandbox side reads [`BridgeConfig`]; the orchestrator side reads
//! [`OrchestratorConfig`] and, for provisioning, [`SandboxSecrets`].

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value, json};

use crate::error::ConfigError;

/// Port the control-plane server listens on inside the sandbox.
pub const DEFAULT_BRIDGE_PORT: u16 = 18790;

/// Agent CLI wrapped by the bridge.
pub const DEFAULT_CLI_BIN: &str = "openclaw";

/// In-sandbox settings for `clawbridge serve`.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind: SocketAddr,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub auth_profiles_path: PathBuf,
    pub sessions_dir: PathBuf,
    pub cli_bin: String,
    pub restart_delay: Duration,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let host: IpAddr =
            parse_optional_env("CLAWBRIDGE_HOST", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?;
        let port: u16 = parse_optional_env("CLAWBRIDGE_PORT", DEFAULT_BRIDGE_PORT)?;
        let state_dir = optional_env("CLAWBRIDGE_STATE_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(default_state_dir);

        let mut config = Self::for_state_dir(SocketAddr::new(host, port), state_dir);
        if let Some(path) = optional_env("CLAWBRIDGE_CONFIG_PATH")? {
            config.config_path = PathBuf::from(path);
        }
        if let Some(path) = optional_env("CLAWBRIDGE_AUTH_PROFILES_PATH")? {
            config.auth_profiles_path = PathBuf::from(path);
        }
        if let Some(path) = optional_env("CLAWBRIDGE_SESSIONS_DIR")? {
            config.sessions_dir = PathBuf::from(path);
        }
        if let Some(bin) = optional_env("CLAWBRIDGE_CLI_BIN")? {
            config.cli_bin = bin;
        }
        config.restart_delay =
            Duration::from_millis(parse_optional_env("CLAWBRIDGE_RESTART_DELAY_MS", 500)?);
        Ok(config)
    }

    /// Defaults with every document path derived from `state_dir`.
    pub fn for_state_dir(bind: SocketAddr, state_dir: PathBuf) -> Self {
        let agent_dir = state_dir.join("agents").join("main");
        Self {
            bind,
            config_path: state_dir.join("openclaw.json"),
            auth_profiles_path: agent_dir.join("agent").join("auth-profiles.json"),
            sessions_dir: agent_dir.join("sessions"),
            state_dir,
            cli_bin: DEFAULT_CLI_BIN.to_string(),
            restart_delay: Duration::from_millis(500),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".openclaw")
}

/// Orchestrator-side settings for reaching and preparing sandboxes.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub bridge_port: u16,
    /// Docker network to take the sandbox address from. `None` means the
    /// first network the container is attached to.
    pub docker_network: Option<String>,
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
    /// State directory as seen inside the container.
    pub sandbox_state_dir: String,
    /// Agent CLI inside the container, used by the legacy exec path.
    pub sandbox_cli_bin: String,
    pub request_timeout: Duration,
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            bridge_port: parse_optional_env("CLAWBRIDGE_BRIDGE_PORT", DEFAULT_BRIDGE_PORT)?,
            docker_network: optional_env("CLAWBRIDGE_DOCKER_NETWORK")?,
            sandbox_uid: parse_optional_env("CLAWBRIDGE_SANDBOX_UID", 1000)?,
            sandbox_gid: parse_optional_env("CLAWBRIDGE_SANDBOX_GID", 1000)?,
            sandbox_state_dir: optional_env("CLAWBRIDGE_SANDBOX_STATE_DIR")?
                .unwrap_or_else(|| "/home/node/.openclaw".to_string()),
            sandbox_cli_bin: optional_env("CLAWBRIDGE_CLI_BIN")?
                .unwrap_or_else(|| DEFAULT_CLI_BIN.to_string()),
            request_timeout: Duration::from_secs(parse_optional_env(
                "CLAWBRIDGE_REQUEST_TIMEOUT_SECS",
                15,
            )?),
        })
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bridge_port: DEFAULT_BRIDGE_PORT,
            docker_network: None,
            sandbox_uid: 1000,
            sandbox_gid: 1000,
            sandbox_state_dir: "/home/node/.openclaw".to_string(),
            sandbox_cli_bin: DEFAULT_CLI_BIN.to_string(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Credentials and settings pushed into a sandbox after it starts.
///
/// These never become container environment variables; they travel through
/// the control plane (or the legacy exec path) only.
#[derive(Debug, Clone, Default)]
pub struct SandboxSecrets {
    pub provider: Option<String>,
    pub api_key: Option<SecretString>,
    /// Auth mode recorded for the provider profile. `api_key` when unset.
    pub auth_mode: Option<String>,
    pub model: Option<String>,
    /// Bot token per channel name (`telegram`, `discord`, ...).
    pub channels: BTreeMap<String, SecretString>,
}

impl SandboxSecrets {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let provider = optional_env("CLAWBRIDGE_PROVIDER")?;
        let api_key = optional_env("CLAWBRIDGE_API_KEY")?.map(SecretString::from);
        if api_key.is_some() && provider.is_none() {
            return Err(ConfigError::InvalidValue {
                key: "CLAWBRIDGE_PROVIDER".to_string(),
                message: "required when CLAWBRIDGE_API_KEY is set".to_string(),
            });
        }

        let mut channels = BTreeMap::new();
        for (channel, var) in [
            ("telegram", "TELEGRAM_BOT_TOKEN"),
            ("discord", "DISCORD_BOT_TOKEN"),
        ] {
            if let Some(token) = optional_env(var)? {
                channels.insert(channel.to_string(), SecretString::from(token));
            }
        }

        Ok(Self {
            provider,
            api_key,
            auth_mode: optional_env("CLAWBRIDGE_AUTH_MODE")?,
            model: optional_env("CLAWBRIDGE_MODEL")?,
            channels,
        })
    }

    /// Whether there is a provider credential to inject.
    pub fn credential(&self) -> Option<(&str, &SecretString)> {
        match (&self.provider, &self.api_key) {
            (Some(provider), Some(key)) => Some((provider.as_str(), key)),
            _ => None,
        }
    }

    /// Non-profile part of the injection: enabled channels with their bot
    /// tokens, and the primary model.
    pub fn config_patch(&self) -> Value {
        let mut patch = Map::new();

        if !self.channels.is_empty() {
            let channels: Map<String, Value> = self
                .channels
                .iter()
                .map(|(name, token)| {
                    (
                        name.clone(),
                        json!({
                            "enabled": true,
                            "accounts": {"default": {"botToken": token.expose_secret()}},
                        }),
                    )
                })
                .collect();
            patch.insert("channels".to_string(), Value::Object(channels));
        }

        if let Some(model) = &self.model {
            patch.insert(
                "agents".to_string(),
                json!({"defaults": {"model": {"primary": model}}}),
            );
        }

        Value::Object(patch)
    }
}

// Helper functions

fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!("failed to read {key}: {e}"))),
    }
}

fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}
