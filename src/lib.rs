//! Sandbox sessions - ephemeral repository sandboxes with terminal access.
//!
//! A request for `(owner, repo)` provisions a remote environment with the
//! repository cloned and a browser terminal running inside it. Sessions
//! are tracked in an in-memory registry until they are stopped or expire,
//! and clients keep their countdown in sync by polling status.

pub mod client;
pub mod config;
pub mod error;
pub mod http_server;
pub mod provider;
pub mod provisioning;
pub mod reconcile;
pub mod registry;
pub mod state;
pub mod status;

pub use client::{ClientError, SandboxClient, WatchOptions};
pub use config::{ProviderConfig, ProviderKind, SandboxConfig, ServeArgs};
pub use error::{Error, ProviderError, ProvisioningStage, Result};
pub use provider::{HttpSandboxProvider, MemoryProvider, SandboxProvider};
pub use provisioning::{create_sandbox, stop_sandbox, CreatedSandbox};
pub use reconcile::{ClientState, SessionTracker};
pub use registry::{SandboxSession, SessionRegistry, SessionStatus};
pub use state::AppState;
pub use status::{get_status, SandboxStatus};
