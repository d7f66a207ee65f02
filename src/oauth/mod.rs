//! Interactive OAuth logins driven through the agent CLI.
//!
//! The CLI prints an authorization URL, the user completes the login in a
//! browser, and the resulting redirect URL is pasted back into the CLI. Both
//! halves arrive as separate HTTP requests, so the CLI process is kept alive
//! between them in a [`FlowRegistry`].

pub mod flow;
pub mod matcher;
pub mod process;

pub use flow::{FlowRegistry, FlowState, FlowSummary, validate_provider};
pub use matcher::{DefaultLoginMatcher, LoginPhase, MatchEvent, OutputMatcher};
pub use process::{ManagedProcess, ProcessEvent, ProcessSpawner, PtySpawner, SpawnedProcess};
