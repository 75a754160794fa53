//! Provisioning workflow: turn `(owner, repo)` into a running sandbox
//! with a reachable terminal, and tear it down again on request.
//!
//! Steps run strictly in order and each is attempted once:
//!
//! 1. create an environment cloning the repository
//! 2. fetch the terminal server binary
//! 3. mark it executable
//! 4. launch it detached on the exposed port
//! 5. resolve the port's public URL
//! 6. register the session
//!
//! The registry is only touched in step 6, so a failure anywhere earlier
//! leaves no trace in it.

use crate::error::{Error, ProviderError, ProvisioningStage, Result};
use crate::provider::{CommandSpec, EnvironmentHandle, EnvironmentSpec, SourceRef};
use crate::registry::SandboxSession;
use crate::state::AppState;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Identifier and terminal address of a freshly provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSandbox {
    pub id: String,
    pub terminal_url: String,
}

/// Owner and repository names may only hold what the git host allows.
fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", field)));
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid || value == "." || value == ".." {
        return Err(Error::Validation(format!("{} contains invalid characters", field)));
    }
    Ok(())
}

fn failed(stage: ProvisioningStage, err: ProviderError) -> Error {
    Error::ProvisioningFailed {
        stage,
        message: err.to_string(),
    }
}

async fn run_step(
    state: &AppState,
    env: &EnvironmentHandle,
    stage: ProvisioningStage,
    command: CommandSpec,
) -> Result<()> {
    info!(sandbox_id = %env.id, %stage, command = %command.display(), "running provisioning step");
    let result = state
        .provider
        .run_command(env, &command)
        .await
        .map_err(|e| failed(stage, e))?;
    if result.success() {
        return Ok(());
    }
    Err(failed(
        stage,
        ProviderError::CommandFailed {
            command: command.display(),
            exit_code: result.exit_code.unwrap_or(-1),
        },
    ))
}

/// Steps 2 to 5. Returns the terminal URL.
async fn prepare_terminal(state: &AppState, env: &EnvironmentHandle) -> Result<String> {
    let config = &state.config;
    let binary = config.terminal_binary();
    let port = config.terminal_port.to_string();

    run_step(
        state,
        env,
        ProvisioningStage::FetchTerminal,
        CommandSpec::new("curl", ["-L", config.terminal_url.as_str(), "-o", binary]),
    )
    .await?;

    run_step(
        state,
        env,
        ProvisioningStage::MarkExecutable,
        CommandSpec::new("chmod", ["+x", binary]).sudo(),
    )
    .await?;

    run_step(
        state,
        env,
        ProvisioningStage::LaunchTerminal,
        CommandSpec::new(
            format!("./{}", binary),
            [
                "-p",
                port.as_str(),
                "-W",
                "-w",
                config.workdir.as_str(),
                "bash",
                "-lc",
                config.agent_command.as_str(),
            ],
        )
        .detached(),
    )
    .await?;

    let url = state
        .provider
        .exposed_url(env, config.terminal_port)
        .await
        .map_err(|e| failed(ProvisioningStage::ResolveUrl, e))?;
    info!(sandbox_id = %env.id, terminal_url = %url, "terminal available");
    Ok(url)
}

/// Best-effort stop of an environment whose provisioning failed.
async fn teardown(state: &AppState, env: &EnvironmentHandle) {
    match state.provider.stop(env).await {
        Ok(()) => info!(sandbox_id = %env.id, "stopped partially provisioned environment"),
        Err(e) => warn!(sandbox_id = %env.id, error = %e, "teardown after failed provisioning did not succeed"),
    }
}

/// Provision a sandbox for `owner/repo` and register it.
pub async fn create_sandbox(state: &AppState, owner: &str, repo: &str) -> Result<CreatedSandbox> {
    validate_name("owner", owner)?;
    validate_name("repo", repo)?;

    let config = &state.config;
    info!(owner, repo, "creating sandbox");

    let spec = EnvironmentSpec {
        source: SourceRef::Git {
            url: config.clone_url(owner, repo),
        },
        vcpus: config.vcpus,
        lifetime: config.max_duration,
        ports: vec![config.terminal_port],
        runtime: config.runtime.clone(),
    };
    let env = state
        .provider
        .create_environment(&spec)
        .await
        .map_err(|e| {
            let err = failed(ProvisioningStage::CreateEnvironment, e);
            error!(owner, repo, error = %err, "failed to create sandbox");
            err
        })?;
    info!(sandbox_id = %env.id, owner, repo, "environment created");

    let terminal_url = match prepare_terminal(state, &env).await {
        Ok(url) => url,
        Err(e) => {
            error!(sandbox_id = %env.id, owner, repo, error = %e, "failed to create sandbox");
            if config.teardown_on_failure {
                teardown(state, &env).await;
            }
            return Err(e);
        }
    };

    let session = SandboxSession::new(env.id.clone(), terminal_url.clone(), config.max_duration);
    // A duplicate id belongs to a live session; its environment must not be stopped.
    state.registry.put(session).await.map_err(|e| {
        error!(sandbox_id = %env.id, error = %e, "failed to register sandbox");
        Error::ProvisioningFailed {
            stage: ProvisioningStage::Register,
            message: e.to_string(),
        }
    })?;

    info!(sandbox_id = %env.id, "sandbox ready");
    Ok(CreatedSandbox {
        id: env.id,
        terminal_url,
    })
}

/// Stop a registered sandbox.
///
/// The registry entry is removed only once the provider confirms the
/// environment is gone; an environment the provider no longer knows
/// counts as confirmed. Any other provider failure keeps the entry.
///
/// While a stop is in flight the id is claimed, so a concurrent stop of
/// the same sandbox answers `NotFound` without calling the provider.
pub async fn stop_sandbox(state: &AppState, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Validation("sandboxId must not be empty".to_string()));
    }
    let session = state
        .registry
        .begin_stop(id)
        .await
        .ok_or_else(|| Error::NotFound(id.to_string()))?;

    match state.provider.stop(&EnvironmentHandle::new(&session.id)).await {
        Ok(()) => {}
        Err(ProviderError::NotFound(_)) => {
            info!(sandbox_id = %id, "environment already gone at provider");
        }
        Err(e) => {
            state.registry.abort_stop(id).await;
            error!(sandbox_id = %id, error = %e, "failed to stop sandbox");
            return Err(Error::StopFailed(e.to_string()));
        }
    }

    state.registry.finish_stop(id).await;
    info!(sandbox_id = %id, "sandbox stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::provider::MemoryProvider;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(config: SandboxConfig) -> (AppState, Arc<MemoryProvider>) {
        let provider = Arc::new(MemoryProvider::new("example.dev"));
        (AppState::new(provider.clone(), config), provider)
    }

    #[tokio::test]
    async fn runs_every_step_in_order() {
        let (state, provider) = setup(SandboxConfig::default());

        let created = create_sandbox(&state, "octocat", "hello-world").await.unwrap();

        assert_eq!(
            provider.calls().await,
            vec!["create", "run:curl", "run:chmod", "run:./ttyd.x86_64", "url:7681"]
        );
        assert_eq!(
            created.terminal_url,
            format!("https://{}-7681.example.dev", created.id)
        );
        assert!(state.registry.get(&created.id).await.is_some());

        let spec = provider.spec(&created.id).await.unwrap();
        assert_eq!(
            spec.source,
            SourceRef::Git {
                url: "https://github.com/octocat/hello-world.git".to_string()
            }
        );
        assert_eq!(spec.ports, vec![7681]);
    }

    #[tokio::test]
    async fn terminal_commands_are_configured() {
        let (state, provider) = setup(SandboxConfig::default());
        let created = create_sandbox(&state, "octocat", "hello-world").await.unwrap();

        let commands = provider.commands(&created.id).await;
        assert_eq!(commands.len(), 3);
        assert!(commands[0].args.contains(&crate::config::DEFAULT_TERMINAL_URL.to_string()));
        assert!(commands[1].sudo);
        let launch = &commands[2];
        assert!(launch.detached);
        assert_eq!(
            launch.args,
            vec!["-p", "7681", "-W", "-w", "/vercel/sandbox", "bash", "-lc", "npx -y opencode-ai"]
        );
    }

    #[tokio::test]
    async fn download_failure_leaves_registry_empty() {
        let (state, provider) = setup(SandboxConfig::default());
        provider.fail_command("curl").await;

        let err = create_sandbox(&state, "octocat", "hello-world").await.unwrap_err();

        assert!(matches!(
            err,
            Error::ProvisioningFailed {
                stage: ProvisioningStage::FetchTerminal,
                ..
            }
        ));
        assert!(state.registry.is_empty().await);
        assert_eq!(provider.calls().await, vec!["create", "run:curl", "stop"]);
        assert_eq!(provider.running_count().await, 0);
    }

    #[tokio::test]
    async fn failed_environment_kept_when_teardown_disabled() {
        let config = SandboxConfig {
            teardown_on_failure: false,
            ..SandboxConfig::default()
        };
        let (state, provider) = setup(config);
        provider.exit_with("chmod", 1).await;

        let err = create_sandbox(&state, "octocat", "hello-world").await.unwrap_err();

        assert!(matches!(
            err,
            Error::ProvisioningFailed {
                stage: ProvisioningStage::MarkExecutable,
                ..
            }
        ));
        assert_eq!(provider.running_count().await, 1);
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn create_failure_makes_no_further_calls() {
        let (state, provider) = setup(SandboxConfig::default());
        provider.fail_create().await;

        let err = create_sandbox(&state, "octocat", "missing").await.unwrap_err();

        assert!(matches!(
            err,
            Error::ProvisioningFailed {
                stage: ProvisioningStage::CreateEnvironment,
                ..
            }
        ));
        assert_eq!(provider.calls().await, vec!["create"]);
    }

    #[tokio::test]
    async fn invalid_names_never_reach_provider() {
        let (state, provider) = setup(SandboxConfig::default());

        for (owner, repo) in [("", "repo"), ("owner", ""), ("own/er", "repo"), ("owner", "..")] {
            let err = create_sandbox(&state, owner, repo).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{owner}/{repo}");
        }
        assert!(provider.calls().await.is_empty());
    }

    #[tokio::test]
    async fn stop_removes_after_provider_confirms() {
        let (state, provider) = setup(SandboxConfig::default());
        let created = create_sandbox(&state, "octocat", "hello-world").await.unwrap();

        stop_sandbox(&state, &created.id).await.unwrap();

        assert!(provider.is_stopped(&created.id).await);
        assert!(state.registry.get(&created.id).await.is_none());
        assert!(matches!(
            stop_sandbox(&state, &created.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stop_failure_keeps_entry() {
        let (state, provider) = setup(SandboxConfig::default());
        let created = create_sandbox(&state, "octocat", "hello-world").await.unwrap();
        provider.fail_stop().await;

        let err = stop_sandbox(&state, &created.id).await.unwrap_err();

        assert!(matches!(err, Error::StopFailed(_)));
        assert_eq!(err.public_message(), "could not stop sandbox");
        assert!(state.registry.get(&created.id).await.is_some());
    }

    #[tokio::test]
    async fn concurrent_stops_reach_provider_once() {
        let (state, provider) = setup(SandboxConfig::default());
        let created = create_sandbox(&state, "octocat", "hello-world").await.unwrap();
        provider.delay_stop(Duration::from_millis(50)).await;

        let (first, second) = tokio::join!(
            stop_sandbox(&state, &created.id),
            stop_sandbox(&state, &created.id)
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(Error::NotFound(_))))
                .count(),
            1
        );
        let stops = provider.calls().await.iter().filter(|c| *c == "stop").count();
        assert_eq!(stops, 1);
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn failed_stop_can_be_retried() {
        let (state, provider) = setup(SandboxConfig::default());
        let created = create_sandbox(&state, "octocat", "hello-world").await.unwrap();
        provider.fail_stop().await;
        assert!(stop_sandbox(&state, &created.id).await.is_err());

        // The claim is released on failure, so the next stop reaches the provider again.
        let err = stop_sandbox(&state, &created.id).await.unwrap_err();
        assert!(matches!(err, Error::StopFailed(_)));
        let stops = provider.calls().await.iter().filter(|c| *c == "stop").count();
        assert_eq!(stops, 2);
    }

    #[tokio::test]
    async fn stop_of_expired_environment_clears_entry() {
        let (state, provider) = setup(SandboxConfig::default());
        let created = create_sandbox(&state, "octocat", "hello-world").await.unwrap();
        provider.expire(&created.id).await;

        stop_sandbox(&state, &created.id).await.unwrap();
        assert!(state.registry.is_empty().await);
    }
}
