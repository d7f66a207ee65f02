//! Per-provider OAuth login flows.
//!
//! ```text
//!  start_login ──► LoginStarted ──(URL seen)──► UrlEmitted
//!                      │ 10s / exit                │ submit_callback
//!                      ▼                           ▼
//!                   removed              CallbackSubmitted
//!                                                  │ success / failure / 20s / exit
//!                                                  ▼
//!                                          killed and removed
//! ```
//!
//! Each waiting step holds a oneshot sender; the pump task that reads process
//! output is the only writer to it, so every phase gets exactly one reply.
//! Starting a login for a provider that already has a flow kills the old
//! process and fails its pending request with `Superseded`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::error::OAuthError;
use crate::oauth::matcher::{LoginPhase, MatchEvent, OutputMatcher, strip_ansi};
use crate::oauth::process::{ManagedProcess, ProcessEvent, ProcessSpawner};

/// How long the CLI gets to print an authorization URL.
pub const URL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the CLI gets to finish after the redirect URL is submitted.
pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(20);

/// Output kept per flow; older bytes are dropped.
const MAX_BUFFER: usize = 64 * 1024;

/// Output returned to the caller on completion or failure.
const MAX_REPORTED_OUTPUT: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    LoginStarted,
    UrlEmitted,
    CallbackSubmitted,
}

/// Snapshot of an in-flight login for `/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSummary {
    pub provider: String,
    pub state: FlowState,
    pub idle_secs: u64,
}

type Reply = oneshot::Sender<Result<String, OAuthError>>;

struct Flow {
    id: u64,
    process: Box<dyn ManagedProcess>,
    buffer: String,
    state: FlowState,
    last_activity: Instant,
    waiter: Option<Reply>,
    /// The PTY echoes the submitted redirect URL back; it is ignored when
    /// scanning for completion.
    echo: Option<String>,
}

impl Flow {
    fn reply(&mut self, result: Result<String, OAuthError>) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(result);
        }
    }

    fn phase(&self) -> Option<LoginPhase> {
        match self.state {
            FlowState::LoginStarted => Some(LoginPhase::AwaitingUrl),
            FlowState::CallbackSubmitted => Some(LoginPhase::AwaitingCompletion),
            FlowState::UrlEmitted => None,
        }
    }

    fn push_output(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        if self.buffer.len() > MAX_BUFFER {
            let mut cut = self.buffer.len() - MAX_BUFFER;
            while !self.buffer.is_char_boundary(cut) {
                cut += 1;
            }
            self.buffer.drain(..cut);
        }
        self.last_activity = Instant::now();
    }

    fn report(&self) -> String {
        let clean = strip_ansi(&self.buffer);
        let clean = clean.trim();
        let mut start = clean.len().saturating_sub(MAX_REPORTED_OUTPUT);
        while !clean.is_char_boundary(start) {
            start += 1;
        }
        clean[start..].to_string()
    }

    /// Feed a chunk of output. Returns `true` once the flow has replied with
    /// its final result and must be torn down.
    fn observe(&mut self, chunk: &str, matcher: &dyn OutputMatcher, provider: &str) -> bool {
        self.push_output(chunk);
        let Some(phase) = self.phase() else {
            return false;
        };

        let scanned = match &self.echo {
            Some(echo) => matcher.scan(phase, &self.buffer.replace(echo.as_str(), "")),
            None => matcher.scan(phase, &self.buffer),
        };

        match scanned {
            Some(MatchEvent::AuthUrl(url)) => {
                tracing::info!(provider, "Login URL emitted");
                self.state = FlowState::UrlEmitted;
                self.reply(Ok(url));
                false
            }
            Some(MatchEvent::Completed) => {
                tracing::info!(provider, "Login completed");
                let output = self.report();
                self.reply(Ok(output));
                true
            }
            Some(MatchEvent::Failed) => {
                tracing::warn!(provider, "Login reported failure");
                let output = self.report();
                self.reply(Err(OAuthError::LoginFailed {
                    provider: provider.to_string(),
                    output,
                }));
                true
            }
            None => false,
        }
    }
}

/// Provider names become CLI arguments.
pub fn validate_provider(provider: &str) -> Result<(), OAuthError> {
    let valid = !provider.is_empty()
        && provider.len() <= 64
        && provider
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(OAuthError::InvalidProvider(provider.to_string()))
    }
}

fn validate_callback(url: &str) -> Result<(), OAuthError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(OAuthError::InvalidCallback {
            reason: "callback URL is empty".to_string(),
        });
    }
    if url.chars().any(char::is_control) {
        return Err(OAuthError::InvalidCallback {
            reason: "callback URL contains control characters".to_string(),
        });
    }
    Ok(())
}

struct FlowInner {
    flows: Mutex<HashMap<String, Flow>>,
    spawner: Arc<dyn ProcessSpawner>,
    matcher: Arc<dyn OutputMatcher>,
    cli_bin: String,
    next_id: AtomicU64,
    url_timeout: Duration,
    completion_timeout: Duration,
}

/// Registry of in-flight logins, at most one per provider.
#[derive(Clone)]
pub struct FlowRegistry {
    inner: Arc<FlowInner>,
}

impl FlowRegistry {
    pub fn new(
        cli_bin: impl Into<String>,
        spawner: Arc<dyn ProcessSpawner>,
        matcher: Arc<dyn OutputMatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(FlowInner {
                flows: Mutex::new(HashMap::new()),
                spawner,
                matcher,
                cli_bin: cli_bin.into(),
                next_id: AtomicU64::new(1),
                url_timeout: URL_TIMEOUT,
                completion_timeout: COMPLETION_TIMEOUT,
            }),
        }
    }

    /// Step 1: spawn the login CLI and wait for its authorization URL.
    pub async fn start_login(&self, provider: &str) -> Result<String, OAuthError> {
        validate_provider(provider)?;

        let args: Vec<String> = ["models", "auth", "login", "--provider", provider]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let spawned = self
            .inner
            .spawner
            .spawn(&self.inner.cli_bin, &args)
            .map_err(|e| OAuthError::SpawnFailed {
                provider: provider.to_string(),
                reason: e.to_string(),
            })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut flows = self.inner.flows.lock().await;
            if let Some(mut old) = flows.remove(provider) {
                tracing::info!(provider, "Replacing in-flight login");
                if let Err(e) = old.process.kill() {
                    tracing::debug!(provider, "Kill of replaced login failed: {}", e);
                }
                old.reply(Err(OAuthError::Superseded {
                    provider: provider.to_string(),
                }));
            }
            flows.insert(
                provider.to_string(),
                Flow {
                    id,
                    process: spawned.handle,
                    buffer: String::new(),
                    state: FlowState::LoginStarted,
                    last_activity: Instant::now(),
                    waiter: Some(tx),
                    echo: None,
                },
            );
        }
        tracing::info!(provider, "Login started");

        tokio::spawn(pump(
            Arc::clone(&self.inner),
            provider.to_string(),
            id,
            spawned.events,
        ));

        match tokio::time::timeout(self.inner.url_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OAuthError::ProcessExited {
                provider: provider.to_string(),
                output: "login was cancelled".to_string(),
            }),
            Err(_) => {
                self.teardown(provider, id).await;
                tracing::warn!(provider, "No login URL within {:?}", self.inner.url_timeout);
                Err(OAuthError::UrlTimeout {
                    provider: provider.to_string(),
                })
            }
        }
    }

    /// Step 2: hand the redirect URL to the waiting CLI and wait for it to
    /// finish.
    pub async fn submit_callback(
        &self,
        provider: &str,
        callback_url: &str,
    ) -> Result<String, OAuthError> {
        validate_provider(provider)?;
        validate_callback(callback_url)?;
        let callback_url = callback_url.trim();

        let (id, rx) = {
            let mut flows = self.inner.flows.lock().await;
            let flow = flows
                .get_mut(provider)
                .filter(|f| f.state == FlowState::UrlEmitted)
                .ok_or_else(|| OAuthError::NoActiveFlow {
                    provider: provider.to_string(),
                })?;

            let (tx, rx) = oneshot::channel();
            flow.buffer.clear();
            flow.process
                .write(format!("{callback_url}\r").as_bytes())
                .map_err(|e| OAuthError::Io {
                    provider: provider.to_string(),
                    reason: e.to_string(),
                })?;
            flow.state = FlowState::CallbackSubmitted;
            flow.waiter = Some(tx);
            flow.echo = Some(callback_url.to_string());
            flow.last_activity = Instant::now();
            (flow.id, rx)
        };
        tracing::info!(provider, "Callback submitted");

        match tokio::time::timeout(self.inner.completion_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OAuthError::ProcessExited {
                provider: provider.to_string(),
                output: "login was cancelled".to_string(),
            }),
            Err(_) => {
                self.teardown(provider, id).await;
                tracing::warn!(
                    provider,
                    "Login did not finish within {:?}",
                    self.inner.completion_timeout
                );
                Err(OAuthError::CallbackTimeout {
                    provider: provider.to_string(),
                })
            }
        }
    }

    /// Kill every in-flight login.
    pub async fn shutdown(&self) {
        let mut flows = self.inner.flows.lock().await;
        for (_, mut flow) in flows.drain() {
            let _ = flow.process.kill();
        }
    }

    pub async fn active_flows(&self) -> Vec<FlowSummary> {
        let flows = self.inner.flows.lock().await;
        let mut summaries: Vec<FlowSummary> = flows
            .iter()
            .map(|(provider, flow)| FlowSummary {
                provider: provider.clone(),
                state: flow.state,
                idle_secs: flow.last_activity.elapsed().as_secs(),
            })
            .collect();
        summaries.sort_by(|a, b| a.provider.cmp(&b.provider));
        summaries
    }

    async fn teardown(&self, provider: &str, id: u64) {
        let mut flows = self.inner.flows.lock().await;
        if let Some(mut flow) = take_current(&mut flows, provider, id) {
            let _ = flow.process.kill();
        }
    }
}

/// Remove the flow for `provider` only if it is still flow `id`.
fn take_current(flows: &mut HashMap<String, Flow>, provider: &str, id: u64) -> Option<Flow> {
    if flows.get(provider).is_some_and(|f| f.id == id) {
        flows.remove(provider)
    } else {
        None
    }
}

/// Route process events for flow `id` until it exits or is replaced.
async fn pump(
    inner: Arc<FlowInner>,
    provider: String,
    id: u64,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        let mut flows = inner.flows.lock().await;
        match event {
            ProcessEvent::Output(chunk) => {
                let finished = match flows.get_mut(&provider).filter(|f| f.id == id) {
                    Some(flow) => flow.observe(&chunk, inner.matcher.as_ref(), &provider),
                    None => return,
                };
                if finished {
                    if let Some(mut flow) = take_current(&mut flows, &provider, id) {
                        let _ = flow.process.kill();
                    }
                    return;
                }
            }
            ProcessEvent::Exited(code) => {
                if let Some(mut flow) = take_current(&mut flows, &provider, id) {
                    tracing::info!(provider = %provider, ?code, "Login process exited");
                    let output = flow.report();
                    flow.reply(Err(OAuthError::ProcessExited {
                        provider: provider.clone(),
                        output,
                    }));
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::oauth::matcher::DefaultLoginMatcher;
    use crate::oauth::process::SpawnedProcess;

    /// Records writes and kills; output is driven by the test.
    struct FakeProcess {
        log: Arc<StdMutex<FakeLog>>,
    }

    #[derive(Default)]
    struct FakeLog {
        writes: Vec<String>,
        kills: usize,
    }

    impl ManagedProcess for FakeProcess {
        fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
            self.log
                .lock()
                .unwrap()
                .writes
                .push(String::from_utf8_lossy(data).into_owned());
            Ok(())
        }

        fn kill(&mut self) -> std::io::Result<()> {
            self.log.lock().unwrap().kills += 1;
            Ok(())
        }

        fn id(&self) -> Option<u32> {
            Some(42)
        }
    }

    struct Spawned {
        events: mpsc::UnboundedSender<ProcessEvent>,
        log: Arc<StdMutex<FakeLog>>,
        args: Vec<String>,
    }

    /// Each spawn emits `script` immediately and hands the sender to the test.
    #[derive(Default)]
    struct FakeSpawner {
        script: Vec<String>,
        spawned: StdMutex<Vec<Spawned>>,
    }

    impl FakeSpawner {
        fn emitting(lines: &[&str]) -> Self {
            Self {
                script: lines.iter().map(|s| s.to_string()).collect(),
                spawned: StdMutex::default(),
            }
        }

        fn sender(&self, index: usize) -> mpsc::UnboundedSender<ProcessEvent> {
            self.spawned.lock().unwrap()[index].events.clone()
        }

        fn log(&self, index: usize) -> Arc<StdMutex<FakeLog>> {
            Arc::clone(&self.spawned.lock().unwrap()[index].log)
        }
    }

    impl ProcessSpawner for FakeSpawner {
        fn spawn(&self, _program: &str, args: &[String]) -> std::io::Result<SpawnedProcess> {
            let (tx, rx) = mpsc::unbounded_channel();
            for line in &self.script {
                let _ = tx.send(ProcessEvent::Output(line.clone()));
            }
            let log = Arc::new(StdMutex::new(FakeLog::default()));
            self.spawned.lock().unwrap().push(Spawned {
                events: tx,
                log: Arc::clone(&log),
                args: args.to_vec(),
            });
            Ok(SpawnedProcess {
                handle: Box::new(FakeProcess { log }),
                events: rx,
            })
        }
    }

    fn registry(spawner: Arc<FakeSpawner>) -> FlowRegistry {
        FlowRegistry::new("openclaw", spawner, Arc::new(DefaultLoginMatcher::new()))
    }

    const URL_OUTPUT: &str = "Auth URL: https://auth.example.com/authorize?state=abc\r\n";

    #[tokio::test]
    async fn test_full_login_flow() {
        let spawner = Arc::new(FakeSpawner::emitting(&[URL_OUTPUT]));
        let flows = registry(spawner.clone());

        let url = flows.start_login("openai-codex").await.unwrap();
        assert_eq!(url, "https://auth.example.com/authorize?state=abc");
        assert_eq!(
            spawner.spawned.lock().unwrap()[0].args,
            vec!["models", "auth", "login", "--provider", "openai-codex"]
        );
        assert_eq!(flows.active_flows().await[0].state, FlowState::UrlEmitted);

        let tx = spawner.sender(0);
        let callback = "http://localhost:1455/auth/callback?code=xyz";
        let pending = {
            let flows = flows.clone();
            tokio::spawn(async move { flows.submit_callback("openai-codex", callback).await })
        };
        // Let the callback land before output arrives.
        while spawner.log(0).lock().unwrap().writes.is_empty() {
            tokio::task::yield_now().await;
        }
        tx.send(ProcessEvent::Output(format!("{callback}\r\n"))).unwrap();
        tx.send(ProcessEvent::Output("Auth profile: openai-codex:default\r\n".into()))
            .unwrap();

        let output = pending.await.unwrap().unwrap();
        assert!(output.contains("Auth profile: openai-codex:default"));
        assert_eq!(spawner.log(0).lock().unwrap().writes, vec![format!("{callback}\r")]);

        assert!(flows.active_flows().await.is_empty());
    }

    #[tokio::test]
    async fn test_completed_login_is_torn_down() {
        let spawner = Arc::new(FakeSpawner::emitting(&[URL_OUTPUT]));
        let flows = registry(spawner.clone());
        flows.start_login("anthropic").await.unwrap();

        let pending = {
            let flows = flows.clone();
            tokio::spawn(async move {
                flows
                    .submit_callback("anthropic", "http://localhost:1455/cb?code=ok")
                    .await
            })
        };
        while spawner.log(0).lock().unwrap().writes.is_empty() {
            tokio::task::yield_now().await;
        }
        // The CLI prints success and then hangs without exiting.
        spawner
            .sender(0)
            .send(ProcessEvent::Output("Auth profile: anthropic:default\r\n".into()))
            .unwrap();

        assert!(pending.await.unwrap().is_ok());
        assert!(flows.active_flows().await.is_empty());
        assert_eq!(spawner.log(0).lock().unwrap().kills, 1);

        // A repeated callback finds no flow.
        assert!(
            flows
                .submit_callback("anthropic", "http://localhost:1455/cb?code=ok")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_second_login_supersedes_first() {
        let spawner = Arc::new(FakeSpawner::default());
        let flows = registry(spawner.clone());

        let first = {
            let flows = flows.clone();
            tokio::spawn(async move { flows.start_login("anthropic").await })
        };
        while spawner.spawned.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        let second = {
            let flows = flows.clone();
            tokio::spawn(async move { flows.start_login("anthropic").await })
        };
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, OAuthError::Superseded { .. }));
        assert_eq!(spawner.log(0).lock().unwrap().kills, 1);

        spawner.sender(1).send(ProcessEvent::Output(URL_OUTPUT.into())).unwrap();
        assert!(second.await.unwrap().is_ok());
        assert_eq!(flows.active_flows().await.len(), 1);

        // Late output from the killed process is ignored.
        let _ = spawner.sender(0).send(ProcessEvent::Exited(None));
        tokio::task::yield_now().await;
        assert_eq!(flows.active_flows().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_url_timeout_kills_process() {
        let spawner = Arc::new(FakeSpawner::emitting(&["Loading...\r\n"]));
        let flows = registry(spawner.clone());

        let err = flows.start_login("anthropic").await.unwrap_err();
        assert!(matches!(err, OAuthError::UrlTimeout { .. }));
        assert_eq!(spawner.log(0).lock().unwrap().kills, 1);
        assert!(flows.active_flows().await.is_empty());
    }

    #[tokio::test]
    async fn test_exit_before_url() {
        let spawner = Arc::new(FakeSpawner::emitting(&["unknown provider\r\n"]));
        let flows = registry(spawner.clone());

        let pending = {
            let flows = flows.clone();
            tokio::spawn(async move { flows.start_login("nope").await })
        };
        while spawner.spawned.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        spawner.sender(0).send(ProcessEvent::Exited(Some(1))).unwrap();

        match pending.await.unwrap().unwrap_err() {
            OAuthError::ProcessExited { output, .. } => assert!(output.contains("unknown provider")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(flows.active_flows().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_output_tears_down_flow() {
        let spawner = Arc::new(FakeSpawner::emitting(&[URL_OUTPUT]));
        let flows = registry(spawner.clone());
        flows.start_login("openai-codex").await.unwrap();

        let pending = {
            let flows = flows.clone();
            tokio::spawn(async move {
                flows
                    .submit_callback("openai-codex", "http://localhost:1455/cb?code=bad")
                    .await
            })
        };
        while spawner.log(0).lock().unwrap().writes.is_empty() {
            tokio::task::yield_now().await;
        }
        spawner
            .sender(0)
            .send(ProcessEvent::Output("OAuth state mismatch\r\n".into()))
            .unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, OAuthError::LoginFailed { .. }));
        assert_eq!(spawner.log(0).lock().unwrap().kills, 1);
        assert!(flows.active_flows().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_timeout() {
        let spawner = Arc::new(FakeSpawner::emitting(&[URL_OUTPUT]));
        let flows = registry(spawner.clone());
        flows.start_login("openai-codex").await.unwrap();

        let err = flows
            .submit_callback("openai-codex", "http://localhost:1455/cb?code=x")
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::CallbackTimeout { .. }));
        assert_eq!(spawner.log(0).lock().unwrap().kills, 1);
    }

    #[tokio::test]
    async fn test_callback_without_flow() {
        let flows = registry(Arc::new(FakeSpawner::default()));
        let err = flows
            .submit_callback("anthropic", "http://localhost/cb")
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::NoActiveFlow { .. }));

        let err = flows.submit_callback("anthropic", "  ").await.unwrap_err();
        assert!(matches!(err, OAuthError::InvalidCallback { .. }));
    }

    #[tokio::test]
    async fn test_invalid_provider_rejected_before_spawn() {
        let spawner = Arc::new(FakeSpawner::default());
        let flows = registry(spawner.clone());
        let err = flows.start_login("x; rm -rf /").await.unwrap_err();
        assert!(matches!(err, OAuthError::InvalidProvider(_)));
        assert!(spawner.spawned.lock().unwrap().is_empty());
    }
}
