//! In-process provider for local development and tests.

use super::{CommandSpec, EnvironmentHandle, EnvironmentSpec, ExitResult, SandboxProvider};
use crate::error::ProviderError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct Environment {
    spec: EnvironmentSpec,
    commands: Vec<CommandSpec>,
    stopped: bool,
}

#[derive(Debug, Default)]
struct State {
    environments: HashMap<String, Environment>,
    calls: Vec<String>,
    failing_commands: HashSet<String>,
    exit_codes: HashMap<String, i32>,
    fail_create: bool,
    fail_stop: bool,
    stop_delay: Option<Duration>,
}

/// Provider that keeps environments in memory.
///
/// Environments never run anything; commands are recorded and succeed
/// unless a failure was injected for them.
#[derive(Debug)]
pub struct MemoryProvider {
    domain: String,
    state: Mutex<State>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new("sandbox.localhost")
    }
}

impl MemoryProvider {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Make every command named `cmd` fail as if the network dropped.
    pub async fn fail_command(&self, cmd: &str) {
        self.state.lock().await.failing_commands.insert(cmd.to_string());
    }

    /// Make every command named `cmd` exit with `code`.
    pub async fn exit_with(&self, cmd: &str, code: i32) {
        self.state.lock().await.exit_codes.insert(cmd.to_string(), code);
    }

    pub async fn fail_create(&self) {
        self.state.lock().await.fail_create = true;
    }

    pub async fn fail_stop(&self) {
        self.state.lock().await.fail_stop = true;
    }

    /// Make every stop take `delay` before it answers.
    pub async fn delay_stop(&self, delay: Duration) {
        self.state.lock().await.stop_delay = Some(delay);
    }

    /// Drop an environment without telling anyone, like a provider-side timeout.
    pub async fn expire(&self, id: &str) {
        self.state.lock().await.environments.remove(id);
    }

    /// Every provider call so far, in order.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn commands(&self, id: &str) -> Vec<CommandSpec> {
        self.state
            .lock()
            .await
            .environments
            .get(id)
            .map(|e| e.commands.clone())
            .unwrap_or_default()
    }

    pub async fn spec(&self, id: &str) -> Option<EnvironmentSpec> {
        self.state
            .lock()
            .await
            .environments
            .get(id)
            .map(|e| e.spec.clone())
    }

    pub async fn is_stopped(&self, id: &str) -> bool {
        self.state
            .lock()
            .await
            .environments
            .get(id)
            .is_some_and(|e| e.stopped)
    }

    /// Environments created and not stopped.
    pub async fn running_count(&self) -> usize {
        self.state
            .lock()
            .await
            .environments
            .values()
            .filter(|e| !e.stopped)
            .count()
    }
}

fn live<'a>(state: &'a mut State, id: &str) -> Result<&'a mut Environment, ProviderError> {
    match state.environments.get_mut(id) {
        Some(env) if !env.stopped => Ok(env),
        _ => Err(ProviderError::NotFound(id.to_string())),
    }
}

#[async_trait]
impl SandboxProvider for MemoryProvider {
    async fn create_environment(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle, ProviderError> {
        let mut state = self.state.lock().await;
        state.calls.push("create".to_string());
        if state.fail_create {
            return Err(ProviderError::Api {
                status: 400,
                message: "repository could not be cloned".to_string(),
            });
        }

        let id = format!("sbx_{}", uuid::Uuid::new_v4().simple());
        debug!(sandbox_id = %id, "memory provider created environment");
        state.environments.insert(
            id.clone(),
            Environment {
                spec: spec.clone(),
                commands: Vec::new(),
                stopped: false,
            },
        );
        Ok(EnvironmentHandle::new(id))
    }

    async fn run_command(
        &self,
        env: &EnvironmentHandle,
        command: &CommandSpec,
    ) -> Result<ExitResult, ProviderError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("run:{}", command.cmd));
        if state.failing_commands.contains(&command.cmd) {
            return Err(ProviderError::Unavailable("connection reset by peer".to_string()));
        }
        let exit_code = state.exit_codes.get(&command.cmd).copied();

        live(&mut state, &env.id)?.commands.push(command.clone());
        if command.detached {
            return Ok(ExitResult { exit_code: None });
        }
        Ok(ExitResult {
            exit_code: Some(exit_code.unwrap_or(0)),
        })
    }

    async fn exposed_url(
        &self,
        env: &EnvironmentHandle,
        port: u16,
    ) -> Result<String, ProviderError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("url:{port}"));
        let environment = live(&mut state, &env.id)?;
        if !environment.spec.ports.contains(&port) {
            return Err(ProviderError::Api {
                status: 400,
                message: format!("port {port} is not exposed"),
            });
        }
        Ok(format!("https://{}-{}.{}", env.id, port, self.domain))
    }

    async fn stop(&self, env: &EnvironmentHandle) -> Result<(), ProviderError> {
        let delay = {
            let mut state = self.state.lock().await;
            state.calls.push("stop".to_string());
            state.stop_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.fail_stop {
            return Err(ProviderError::Unavailable("stop request timed out".to_string()));
        }
        live(&mut state, &env.id)?.stopped = true;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<EnvironmentHandle, ProviderError> {
        let mut state = self.state.lock().await;
        state.calls.push("get".to_string());
        live(&mut state, id)?;
        Ok(EnvironmentHandle::new(id))
    }
}
