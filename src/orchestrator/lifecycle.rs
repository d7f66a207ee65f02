//! Sandbox lifecycle coordination.
//!
//! ```text
//! container created
//!        │
//!        ▼
//!  wait_running ──► fix_permissions ──► wait_for_bridge ──► inject via bridge
//!                                            │                    │
//!                                  unreachable / 5xx         wait_for_bridge
//!                                            ▼                    │
//!                                   legacy exec inject            ▼
//!                                   + container restart         ready
//! ```
//!
//! Credentials are never set as container environment variables. They reach
//! the sandbox either through `/auth/add` and `/config/update` or, when the
//! bridge is down, through CLI invocations run with container exec.

use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::Value;

use crate::bridge::ReloadRequest;
use crate::bridge::types::LoginCompleted;
use crate::config::{OrchestratorConfig, SandboxSecrets};
use crate::error::{BridgeError, LifecycleError};
use crate::orchestrator::client::{BridgeClient, RetryPolicy};
use crate::orchestrator::project::ProjectRepository;
use crate::orchestrator::runtime::{ContainerInfo, ContainerRuntime, ExecSpec};

/// Timings and sandbox layout used by the coordinator.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub running_poll_interval: Duration,
    pub running_timeout: Duration,
    pub bridge_poll_interval: Duration,
    pub bridge_timeout: Duration,
    pub bridge_port: u16,
    pub network: Option<String>,
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
    pub state_dir: String,
    pub cli_bin: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for LifecycleConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            running_poll_interval: Duration::from_secs(1),
            running_timeout: Duration::from_secs(30),
            bridge_poll_interval: Duration::from_secs(2),
            bridge_timeout: Duration::from_secs(30),
            bridge_port: config.bridge_port,
            network: config.docker_network.clone(),
            sandbox_uid: config.sandbox_uid,
            sandbox_gid: config.sandbox_gid,
            state_dir: config.sandbox_state_dir.clone(),
            cli_bin: config.sandbox_cli_bin.clone(),
            request_timeout: config.request_timeout,
            retry: RetryPolicy::default(),
        }
    }
}

impl LifecycleConfig {
    fn sandbox_user(&self) -> String {
        format!("{}:{}", self.sandbox_uid, self.sandbox_gid)
    }
}

/// Which route the credentials took into the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionPath {
    Bridge,
    LegacyExec,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionReport {
    pub container_id: String,
    pub path: ProvisionPath,
    pub permissions_fixed: bool,
    /// Names of what was injected (`auth:<provider>`, `channels.<name>`,
    /// `model`). Never the values.
    pub injected: Vec<String>,
    /// Whether the sandbox answered after injection.
    pub ready: bool,
}

/// What the orchestrator knows about a sandbox right now.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SandboxStatus {
    /// The control plane answered `/status`.
    Bridge { status: Value },
    /// The control plane is down; this is the container runtime's view.
    Container {
        running: bool,
        state: String,
        reason: String,
    },
}

impl SandboxStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Container { .. })
    }
}

pub struct Coordinator {
    runtime: Arc<dyn ContainerRuntime>,
    config: LifecycleConfig,
}

impl Coordinator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: LifecycleConfig) -> Self {
        Self { runtime, config }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Poll inspect until the container reports running.
    pub async fn wait_running(&self, container_id: &str) -> Result<ContainerInfo, LifecycleError> {
        let deadline = tokio::time::Instant::now() + self.config.running_timeout;
        loop {
            let info = self.runtime.inspect(container_id).await?;
            if info.running {
                return Ok(info);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LifecycleError::NotRunning {
                    container_id: container_id.to_string(),
                    waited: self.config.running_timeout,
                });
            }
            tracing::debug!(container_id = %container_id, status = %info.status, "Waiting for container");
            tokio::time::sleep(self.config.running_poll_interval).await;
        }
    }

    /// `chown -R` the state directory to the sandbox user. Failure is logged
    /// and reported, not fatal: an image built with the right ownership
    /// works without it.
    pub async fn fix_permissions(&self, container_id: &str) -> bool {
        let spec = ExecSpec::new(vec![
            "chown".to_string(),
            "-R".to_string(),
            self.config.sandbox_user(),
            self.config.state_dir.clone(),
        ])
        .as_user("root");

        match self.runtime.exec(container_id, spec).await {
            Ok(out) if out.success() => true,
            Ok(out) => {
                tracing::warn!(
                    container_id = %container_id,
                    exit_code = out.exit_code,
                    "chown of state dir failed: {}",
                    out.stderr.trim()
                );
                false
            }
            Err(e) => {
                tracing::warn!(container_id = %container_id, "chown of state dir failed: {}", e);
                false
            }
        }
    }

    /// Client for the container's control plane with the configured retry
    /// policy and timeout.
    pub async fn bridge_client(&self, container_id: &str) -> Result<BridgeClient, BridgeError> {
        let client = BridgeClient::resolve(
            self.runtime.as_ref(),
            container_id,
            self.config.bridge_port,
            self.config.network.as_deref(),
        )
        .await?;
        Ok(client
            .with_retry_policy(self.config.retry.clone())
            .with_timeout(self.config.request_timeout))
    }

    async fn wait_for_bridge(&self, client: &BridgeClient) -> bool {
        client
            .wait_for_bridge(self.config.bridge_poll_interval, self.config.bridge_timeout)
            .await
    }

    /// Bring a freshly created container to a ready, credentialed state.
    pub async fn provision(
        &self,
        container_id: &str,
        secrets: &SandboxSecrets,
    ) -> Result<ProvisionReport, LifecycleError> {
        self.wait_running(container_id).await?;
        let permissions_fixed = self.fix_permissions(container_id).await;

        match self.provision_via_bridge(container_id, secrets).await {
            Ok((injected, ready)) => {
                tracing::info!(container_id = %container_id, ready, "Provisioned through bridge");
                Ok(ProvisionReport {
                    container_id: container_id.to_string(),
                    path: ProvisionPath::Bridge,
                    permissions_fixed,
                    injected,
                    ready,
                })
            }
            Err(e) if falls_back(&e) => {
                tracing::warn!(
                    container_id = %container_id,
                    "Bridge unavailable, using legacy exec path: {}",
                    e
                );
                let injected = self.provision_via_exec(container_id, secrets).await?;
                Ok(ProvisionReport {
                    container_id: container_id.to_string(),
                    path: ProvisionPath::LegacyExec,
                    permissions_fixed,
                    injected,
                    ready: true,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn provision_via_bridge(
        &self,
        container_id: &str,
        secrets: &SandboxSecrets,
    ) -> Result<(Vec<String>, bool), BridgeError> {
        let client = self.bridge_client(container_id).await?;
        if !self.wait_for_bridge(&client).await {
            return Err(BridgeError::Unreachable {
                url: client.base_url().to_string(),
                reason: format!("no answer within {:?}", self.config.bridge_timeout),
            });
        }

        let patch = secrets.config_patch();
        let has_patch = patch.as_object().is_some_and(|map| !map.is_empty());
        let mut injected = Vec::new();

        if let Some((provider, key)) = secrets.credential() {
            // Restart once, after the last write.
            let reload = if has_patch {
                ReloadRequest::none()
            } else {
                ReloadRequest::default()
            };
            client
                .add_auth(provider, key, secrets.auth_mode.as_deref(), reload)
                .await?;
            injected.push(format!("auth:{provider}"));
        }
        if has_patch {
            client
                .update_config(&patch, ReloadRequest::default())
                .await?;
            injected.extend(patch_items(&patch));
        }

        let ready = injected.is_empty() || self.wait_for_bridge(&client).await;
        Ok((injected, ready))
    }

    /// Replay the injection as CLI calls inside the container, then restart
    /// it so the runtime reloads.
    async fn provision_via_exec(
        &self,
        container_id: &str,
        secrets: &SandboxSecrets,
    ) -> Result<Vec<String>, LifecycleError> {
        let mut injected = Vec::new();
        let cli = &self.config.cli_bin;

        if let Some((provider, key)) = secrets.credential() {
            let cmd = vec![
                cli.clone(),
                "models".to_string(),
                "auth".to_string(),
                "paste-token".to_string(),
                "--provider".to_string(),
                provider.to_string(),
            ];
            let stdin = format!("{}\n", key.expose_secret()).into_bytes();
            self.exec_checked(container_id, ExecSpec::new(cmd).with_stdin(stdin), secrets)
                .await?;
            injected.push(format!("auth:{provider}"));
        }

        let patch = secrets.config_patch();
        let mut leaves = Vec::new();
        collect_leaves(&patch, &mut Vec::new(), &mut leaves);
        for (path, value) in leaves {
            let spec = if is_credential_path(&path) {
                // The shell reads the value from stdin so it stays out of argv.
                let cmd = vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    STDIN_CONFIG_SET.to_string(),
                    cli.clone(),
                    path,
                ];
                ExecSpec::new(cmd).with_stdin(format!("{value}\n").into_bytes())
            } else {
                ExecSpec::new(vec![
                    cli.clone(),
                    "config".to_string(),
                    "set".to_string(),
                    path,
                    value.to_string(),
                ])
            };
            self.exec_checked(container_id, spec, secrets).await?;
        }
        injected.extend(patch_items(&patch));

        if !injected.is_empty() {
            self.runtime.restart(container_id).await?;
            self.wait_running(container_id).await?;
        }
        Ok(injected)
    }

    async fn exec_checked(
        &self,
        container_id: &str,
        spec: ExecSpec,
        secrets: &SandboxSecrets,
    ) -> Result<(), LifecycleError> {
        let out = self
            .runtime
            .exec(container_id, spec.as_user(self.config.sandbox_user()))
            .await?;
        if out.success() {
            return Ok(());
        }
        let output = match out.stderr.trim() {
            "" => out.stdout.trim(),
            stderr => stderr,
        };
        Err(LifecycleError::ExecFailed {
            container_id: container_id.to_string(),
            code: out.exit_code,
            output: scrub(output, secrets),
        })
    }

    /// Bridge status when the control plane answers, otherwise the container
    /// state. Never fails because the bridge is down.
    pub async fn sandbox_status(&self, container_id: &str) -> Result<SandboxStatus, LifecycleError> {
        let reason = match self.bridge_client(container_id).await {
            Ok(client) => match client.with_retry_policy(RetryPolicy::none()).status().await {
                Ok(status) => return Ok(SandboxStatus::Bridge { status }),
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };

        let info = self.runtime.inspect(container_id).await?;
        Ok(SandboxStatus::Container {
            running: info.running,
            state: info.status,
            reason,
        })
    }

    /// First half of an OAuth login. Requires the bridge.
    pub async fn start_login(
        &self,
        container_id: &str,
        provider: &str,
    ) -> Result<String, LifecycleError> {
        let client = self.bridge_client(container_id).await?;
        Ok(client.start_login(provider).await?)
    }

    pub async fn submit_callback(
        &self,
        container_id: &str,
        provider: &str,
        callback_url: &str,
    ) -> Result<LoginCompleted, LifecycleError> {
        let client = self.bridge_client(container_id).await?;
        Ok(client.submit_callback(provider, callback_url).await?)
    }

    /// Look a project up and provision its container with its credentials.
    pub async fn provision_project(
        &self,
        projects: &dyn ProjectRepository,
        project_id: &str,
    ) -> Result<ProvisionReport, LifecycleError> {
        let project = projects
            .get(project_id)
            .await?
            .ok_or_else(|| LifecycleError::ProjectNotFound(project_id.to_string()))?;
        let container_id = project.container_id.as_deref().ok_or_else(|| {
            LifecycleError::Runtime {
                reason: format!("project {project_id} has no container"),
            }
        })?;
        self.provision(container_id, &project.sandbox_secrets()).await
    }
}

/// Errors that mean "the bridge is not there" rather than "the bridge said no".
fn falls_back(e: &BridgeError) -> bool {
    e.is_transient() || matches!(e, BridgeError::AddressUnresolved { .. })
}

fn patch_items(patch: &Value) -> Vec<String> {
    let mut items = Vec::new();
    if let Some(channels) = patch.get("channels").and_then(Value::as_object) {
        items.extend(channels.keys().map(|name| format!("channels.{name}")));
    }
    if patch.get("agents").is_some() {
        items.push("model".to_string());
    }
    items
}

/// Flatten a patch into `(dotted.path, value)` pairs, one per non-object leaf.
/// `config set` with the value read from stdin. `$0` is the CLI, `$1` the path.
const STDIN_CONFIG_SET: &str = r#"IFS= read -r v; exec "$0" config set "$1" "$v""#;

/// Config leaves that hold a credential.
fn is_credential_path(path: &str) -> bool {
    matches!(
        path.rsplit('.').next(),
        Some("botToken" | "token" | "key" | "apiKey")
    )
}

fn collect_leaves(value: &Value, prefix: &mut Vec<String>, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                prefix.push(key.clone());
                collect_leaves(child, prefix, out);
                prefix.pop();
            }
        }
        leaf if !prefix.is_empty() => out.push((prefix.join("."), leaf.clone())),
        _ => {}
    }
}

fn scrub(text: &str, secrets: &SandboxSecrets) -> String {
    let values = secrets
        .api_key
        .iter()
        .chain(secrets.channels.values())
        .map(|s| s.expose_secret())
        .filter(|s| !s.is_empty());
    values.fold(text.to_string(), |acc, secret| {
        acc.replace(secret, "[REDACTED]")
    })
}
