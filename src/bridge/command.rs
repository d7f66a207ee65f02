//! One-shot invocations of the wrapped agent CLI.
//!
//! Result classification:
//!
//! | stdout          | exit     | result                         |
//! |-----------------|----------|--------------------------------|
//! | valid JSON      | any      | success, parsed JSON           |
//! | not JSON        | 0        | success, `{stdout, stderr}`    |
//! | not JSON        | non-zero | `CommandError::Failed`         |
//!
//! Several CLI subcommands (`doctor`, `status --json`) report findings with a
//! non-zero exit while still printing a complete JSON document, which is why
//! stdout wins over the exit code.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::process::Command;

use crate::error::CommandError;

/// Wall-clock limit for a single CLI invocation.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of invocations kept for `/status`.
pub const HISTORY_CAPACITY: usize = 20;

/// A finished invocation as reported by `/status`.
///
/// Only the first two arguments are recorded; later ones may carry values
/// the caller considers sensitive.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command: String,
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

/// Bounded ring buffer of recent invocations.
#[derive(Debug)]
pub struct CommandHistory {
    records: Mutex<VecDeque<CommandRecord>>,
    capacity: usize,
}

impl CommandHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, record: CommandRecord) {
        if let Ok(mut records) = self.records.lock() {
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(record);
        }
    }

    /// Most recent first.
    pub fn recent(&self) -> Vec<CommandRecord> {
        self.records
            .lock()
            .map(|records| records.iter().rev().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

/// Runs the wrapped CLI binary with caller-supplied arguments.
pub struct CommandRunner {
    bin: String,
    timeout: Duration,
    history: CommandHistory,
}

impl CommandRunner {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            timeout: COMMAND_TIMEOUT,
            history: CommandHistory::default(),
        }
    }

    /// Override the timeout (for testing).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    pub fn history(&self) -> &CommandHistory {
        &self.history
    }

    /// Run `<bin> <args...>` and classify the result.
    pub async fn run(&self, args: &[String]) -> Result<Value, CommandError> {
        if args.is_empty() {
            return Err(CommandError::EmptyArgs);
        }

        let label = args
            .iter()
            .take(2)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        let started = Instant::now();
        tracing::debug!(command = %label, "Running CLI command");

        let result = self.execute(args).await;

        let (ok, exit_code) = match &result {
            Ok((_, code)) => (true, *code),
            Err(CommandError::Failed { code, .. }) => (false, Some(*code)),
            Err(_) => (false, None),
        };
        self.history.record(CommandRecord {
            command: label.clone(),
            ok,
            exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            at: Utc::now(),
        });

        match &result {
            Ok(_) => tracing::info!(command = %label, ?exit_code, "CLI command finished"),
            Err(e) => tracing::warn!(command = %label, "CLI command failed: {}", e),
        }
        result.map(|(value, _)| value)
    }

    async fn execute(&self, args: &[String]) -> Result<(Value, Option<i32>), CommandError> {
        let child = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CommandError::SpawnFailed {
                bin: self.bin.clone(),
                reason: e.to_string(),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CommandError::Timeout(self.timeout))?
            .map_err(|e| CommandError::SpawnFailed {
                bin: self.bin.clone(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let code = output.status.code();

        classify(stdout, stderr, code).map(|value| (value, code))
    }
}

fn classify(stdout: String, stderr: String, code: Option<i32>) -> Result<Value, CommandError> {
    let trimmed = stdout.trim();
    if !trimmed.is_empty()
        && let Ok(value) = serde_json::from_str::<Value>(trimmed)
    {
        return Ok(value);
    }
    match code {
        Some(0) => Ok(json!({ "stdout": stdout, "stderr": stderr })),
        // Killed by a signal: no exit code.
        other => Err(CommandError::Failed {
            code: other.unwrap_or(-1),
            stdout,
            stderr,
        }),
    }
}
