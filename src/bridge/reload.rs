//! Post-write reload handling.
//!
//! The agent runtime runs as the parent of the bridge process and restarts
//! itself on `SIGUSR1`. After a config write the server either schedules that
//! signal (`restart`) or does nothing and lets the runtime's file watcher pick
//! the change up (`hot-reload`).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;

use crate::bridge::types::ReloadOutcome;

/// Delay between responding and signalling, so the response flushes first.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(500);

pub const RELOAD_HEADER: &str = "x-reload";
pub const STRATEGY_HEADER: &str = "x-strategy";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReloadStrategy {
    #[default]
    Restart,
    HotReload,
}

impl ReloadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::HotReload => "hot-reload",
        }
    }
}

impl FromStr for ReloadStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "restart" => Ok(Self::Restart),
            "hot-reload" | "hot_reload" | "hot" => Ok(Self::HotReload),
            other => Err(format!("unknown reload strategy: {other}")),
        }
    }
}

impl std::fmt::Display for ReloadStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reload options carried by request headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadRequest {
    pub reload: bool,
    pub strategy: ReloadStrategy,
}

impl Default for ReloadRequest {
    fn default() -> Self {
        Self {
            reload: true,
            strategy: ReloadStrategy::Restart,
        }
    }
}

impl ReloadRequest {
    pub fn none() -> Self {
        Self {
            reload: false,
            ..Self::default()
        }
    }

    pub fn hot() -> Self {
        Self {
            reload: true,
            strategy: ReloadStrategy::HotReload,
        }
    }

    /// Parse `x-reload` / `x-strategy`. Absent headers mean reload with
    /// restart; an unknown strategy is rejected.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, String> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let reload = match header(RELOAD_HEADER) {
            None => true,
            Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => false,
            Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => true,
            Some(v) => return Err(format!("invalid {RELOAD_HEADER} header: {v}")),
        };
        let strategy = match header(STRATEGY_HEADER) {
            None => ReloadStrategy::default(),
            Some(v) => v.parse()?,
        };
        Ok(Self { reload, strategy })
    }

    /// Header pairs for an outgoing request.
    pub fn headers(&self) -> [(&'static str, String); 2] {
        [
            (RELOAD_HEADER, self.reload.to_string()),
            (STRATEGY_HEADER, self.strategy.as_str().to_string()),
        ]
    }
}

/// How the runtime is told to restart.
pub trait RestartSignaler: Send + Sync {
    /// Ask the parent runtime to restart.
    fn signal_parent(&self) -> std::io::Result<()>;

    /// Terminate this process so the supervisor restarts the sandbox.
    fn exit_self(&self);
}

/// Sends `SIGUSR1` to the parent process.
pub struct ParentSignaler;

impl RestartSignaler for ParentSignaler {
    #[cfg(unix)]
    fn signal_parent(&self) -> std::io::Result<()> {
        // SAFETY: getppid has no preconditions; kill only sends a signal.
        let rc = unsafe { libc::kill(libc::getppid(), libc::SIGUSR1) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn signal_parent(&self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "parent signalling requires unix",
        ))
    }

    fn exit_self(&self) {
        std::process::exit(0);
    }
}

/// Applies a [`ReloadRequest`] after a successful write.
pub struct Reloader {
    signaler: Arc<dyn RestartSignaler>,
    delay: Duration,
}

impl Reloader {
    pub fn new(signaler: Arc<dyn RestartSignaler>, delay: Duration) -> Self {
        Self { signaler, delay }
    }

    /// Decide the outcome and, for a restart, schedule the signal in the
    /// background. Returns immediately.
    pub fn apply(&self, request: ReloadRequest) -> ReloadOutcome {
        if !request.reload {
            tracing::debug!("Reload suppressed by request");
            return ReloadOutcome::Skipped;
        }
        match request.strategy {
            ReloadStrategy::HotReload => {
                tracing::info!("Config written; leaving reload to the runtime's file watcher");
                ReloadOutcome::HotReload
            }
            ReloadStrategy::Restart => {
                let signaler = Arc::clone(&self.signaler);
                let delay = self.delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    match signaler.signal_parent() {
                        Ok(()) => tracing::info!("Sent restart signal to runtime"),
                        Err(e) => {
                            tracing::warn!("Failed to signal runtime ({}), exiting instead", e);
                            signaler.exit_self();
                        }
                    }
                });
                ReloadOutcome::Restart
            }
        }
    }
}

impl Default for Reloader {
    fn default() -> Self {
        Self::new(Arc::new(ParentSignaler), DEFAULT_RESTART_DELAY)
    }
}
