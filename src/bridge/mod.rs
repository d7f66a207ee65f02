//! In-sandbox control plane.
//!
//! ```text
//! orchestrator ──HTTP──► ControlPlaneServer
//!                          ├── ConfigStore + merge   (config/update, auth/add)
//!                          ├── CommandRunner         (command)
//!                          ├── FlowRegistry          (auth/login, auth/callback)
//!                          └── SessionStore          (sessions)
//! ```

pub mod command;
pub mod reload;
pub mod server;
pub mod sessions;
pub mod types;

pub use command::{CommandHistory, CommandRecord, CommandRunner};
pub use reload::{ReloadRequest, ReloadStrategy, Reloader, RestartSignaler};
pub use server::{ApiError, BridgeState, ControlPlaneServer};
pub use sessions::SessionStore;
pub use types::Envelope;
