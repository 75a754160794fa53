//! Remote sandbox provider abstraction.
//!
//! The provider creates isolated environments, runs commands inside them,
//! exposes ports over routable URLs and enforces a hard lifetime. Two
//! backends are available: [`HttpSandboxProvider`] talks to a hosted
//! sandbox API, [`MemoryProvider`] keeps everything in-process.

mod http;
mod memory;

pub use http::HttpSandboxProvider;
pub use memory::MemoryProvider;

use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where the environment's source tree comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceRef {
    Git { url: String },
}

/// Everything needed to request a new environment.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub source: SourceRef,
    pub vcpus: u32,
    pub lifetime: Duration,
    pub ports: Vec<u16>,
    pub runtime: String,
}

/// Opaque reference to a provider environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvironmentHandle {
    pub id: String,
}

impl EnvironmentHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A command to run inside an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub cmd: String,
    pub args: Vec<String>,
    /// Run with elevated privilege.
    pub sudo: bool,
    /// Return as soon as the command starts.
    pub detached: bool,
}

impl CommandSpec {
    pub fn new<I, S>(cmd: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into(),
            args: args.into_iter().map(Into::into).collect(),
            sudo: false,
            detached: false,
        }
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    /// Rendered command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.cmd.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Outcome of a command. Detached commands have no exit code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitResult {
    pub exit_code: Option<i32>,
}

impl ExitResult {
    pub fn success(&self) -> bool {
        self.exit_code.map_or(true, |code| code == 0)
    }
}

/// Operations consumed from the external sandbox provider.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create_environment(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle, ProviderError>;

    async fn run_command(
        &self,
        env: &EnvironmentHandle,
        command: &CommandSpec,
    ) -> Result<ExitResult, ProviderError>;

    async fn exposed_url(&self, env: &EnvironmentHandle, port: u16)
        -> Result<String, ProviderError>;

    async fn stop(&self, env: &EnvironmentHandle) -> Result<(), ProviderError>;

    /// Look up an environment; `ProviderError::NotFound` once it is gone.
    async fn get(&self, id: &str) -> Result<EnvironmentHandle, ProviderError>;
}
