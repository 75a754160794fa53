//! Service configuration, read from flags or the environment.

use clap::{Args, ValueEnum};
use std::time::Duration;

/// Pinned terminal server release fetched into every sandbox.
pub const DEFAULT_TERMINAL_URL: &str =
    "https://github.com/tsl0922/ttyd/releases/download/1.7.7/ttyd.x86_64";

/// Longest lifetime `serve` accepts, one day.
pub const MAX_LIFETIME_MINUTES: u64 = 24 * 60;

/// Which provider backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// Hosted sandbox REST API
    Http,
    /// In-process provider, no real environments
    Memory,
}

/// Connection settings for the hosted provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub team_id: Option<String>,
    pub project_id: Option<String>,
    pub request_timeout_secs: u64,
}

/// How sandboxes are provisioned. Shared read-only by all requests.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub git_host: String,
    pub max_duration: Duration,
    pub vcpus: u32,
    pub runtime: String,
    pub terminal_port: u16,
    pub terminal_url: String,
    pub workdir: String,
    pub agent_command: String,
    /// Stop the environment when a later provisioning step fails.
    pub teardown_on_failure: bool,
    /// Ask the provider whether a session still exists on every status read.
    pub verify_on_read: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            git_host: "github.com".to_string(),
            max_duration: Duration::from_secs(30 * 60),
            vcpus: 2,
            runtime: "node22".to_string(),
            terminal_port: 7681,
            terminal_url: DEFAULT_TERMINAL_URL.to_string(),
            workdir: "/vercel/sandbox".to_string(),
            agent_command: "npx -y opencode-ai".to_string(),
            teardown_on_failure: true,
            verify_on_read: false,
        }
    }
}

impl SandboxConfig {
    pub fn clone_url(&self, owner: &str, repo: &str) -> String {
        format!("https://{}/{}/{}.git", self.git_host, owner, repo)
    }

    /// File name the terminal binary is saved under inside the sandbox.
    pub fn terminal_binary(&self) -> &str {
        self.terminal_url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("ttyd")
    }
}

/// Options for `serve`.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Provider backend
    #[arg(long, env = "SANDBOX_PROVIDER", value_enum, default_value = "http")]
    pub provider: ProviderKind,

    /// Base URL of the sandbox provider API
    #[arg(long, env = "SANDBOX_API_URL", default_value = "https://api.vercel.com")]
    pub provider_url: String,

    /// Bearer token for the provider API
    #[arg(long, env = "SANDBOX_API_TOKEN", hide_env_values = true)]
    pub provider_token: Option<String>,

    /// Team scope for provider requests
    #[arg(long, env = "SANDBOX_TEAM_ID")]
    pub team_id: Option<String>,

    /// Project that owns created sandboxes
    #[arg(long, env = "SANDBOX_PROJECT_ID")]
    pub project_id: Option<String>,

    /// Per-request timeout for provider calls, in seconds
    #[arg(long, env = "SANDBOX_API_TIMEOUT", default_value = "120")]
    pub provider_timeout: u64,

    /// Maximum lifetime of a sandbox, in minutes (1 to 1440)
    #[arg(
        long,
        env = "SANDBOX_MAX_MINUTES",
        default_value = "30",
        value_parser = clap::value_parser!(u64).range(1..=MAX_LIFETIME_MINUTES)
    )]
    pub max_minutes: u64,

    /// vCPUs per sandbox
    #[arg(long, env = "SANDBOX_VCPUS", default_value = "2")]
    pub vcpus: u32,

    /// Sandbox runtime image
    #[arg(long, env = "SANDBOX_RUNTIME", default_value = "node22")]
    pub runtime: String,

    /// Host repositories are cloned from
    #[arg(long, env = "SANDBOX_GIT_HOST", default_value = "github.com")]
    pub git_host: String,

    /// Port the terminal server listens on inside the sandbox
    #[arg(long, env = "SANDBOX_TERMINAL_PORT", default_value = "7681")]
    pub terminal_port: u16,

    /// Download URL of the terminal server binary
    #[arg(long, env = "SANDBOX_TERMINAL_URL", default_value = DEFAULT_TERMINAL_URL)]
    pub terminal_url: String,

    /// Working directory of the terminal shell (the clone target)
    #[arg(long, env = "SANDBOX_WORKDIR", default_value = "/vercel/sandbox")]
    pub workdir: String,

    /// Command started in the terminal on connection
    #[arg(long, env = "SANDBOX_AGENT_COMMAND", default_value = "npx -y opencode-ai")]
    pub agent_command: String,

    /// Leave environments running when provisioning fails midway
    #[arg(long, env = "SANDBOX_KEEP_FAILED")]
    pub keep_failed: bool,

    /// Check with the provider on every status read
    #[arg(long, env = "SANDBOX_VERIFY_ON_READ")]
    pub verify_on_read: bool,
}

impl ServeArgs {
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            base_url: self.provider_url.clone(),
            token: self.provider_token.clone(),
            team_id: self.team_id.clone(),
            project_id: self.project_id.clone(),
            request_timeout_secs: self.provider_timeout,
        }
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            git_host: self.git_host.clone(),
            max_duration: Duration::from_secs(self.max_minutes * 60),
            vcpus: self.vcpus,
            runtime: self.runtime.clone(),
            terminal_port: self.terminal_port,
            terminal_url: self.terminal_url.clone(),
            workdir: self.workdir.clone(),
            agent_command: self.agent_command.clone(),
            teardown_on_failure: !self.keep_failed,
            verify_on_read: self.verify_on_read,
        }
    }
}
