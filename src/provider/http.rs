//! REST client for a hosted sandbox API.

use super::{
    CommandSpec, EnvironmentHandle, EnvironmentSpec, ExitResult, SandboxProvider, SourceRef,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

// Request/Response types
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
    source: &'a SourceRef,
    resources: Resources,
    timeout: u64,
    ports: &'a [u16],
    runtime: &'a str,
}

#[derive(Serialize)]
struct Resources {
    vcpus: u32,
}

#[derive(Deserialize)]
struct SandboxEnvelope {
    sandbox: SandboxBody,
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Deserialize)]
struct SandboxBody {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct Route {
    port: u16,
    #[serde(default)]
    subdomain: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Serialize)]
struct RunCommandRequest<'a> {
    command: &'a str,
    args: &'a [String],
    sudo: bool,
}

#[derive(Deserialize)]
struct CommandEnvelope {
    command: CommandBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandBody {
    id: String,
    #[serde(default)]
    exit_code: Option<i32>,
}

/// Provider backed by a hosted sandbox REST API.
pub struct HttpSandboxProvider {
    client: Client,
    config: ProviderConfig,
}

impl HttpSandboxProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("http client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(team_id) = &self.config.team_id {
            builder = builder.query(&[("teamId", team_id)]);
        }
        builder
    }

    async fn fetch(&self, id: &str) -> Result<SandboxEnvelope, ProviderError> {
        let resp = self
            .request(Method::GET, &format!("/v1/sandboxes/{}", id))
            .send()
            .await?;
        let envelope: SandboxEnvelope = check(resp, id).await?.json().await?;
        match envelope.sandbox.status.as_deref() {
            Some("stopped") | Some("stopping") | Some("failed") => {
                Err(ProviderError::NotFound(id.to_string()))
            }
            _ => Ok(envelope),
        }
    }
}

/// Map non-success statuses onto the provider error taxonomy.
async fn check(resp: Response, id: &str) -> Result<Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(ProviderError::NotFound(id.to_string()));
    }
    if status.is_server_error() {
        return Err(ProviderError::Unavailable(format!("{}: {}", status, message)));
    }
    Err(ProviderError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn create_environment(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle, ProviderError> {
        let body = CreateSandboxRequest {
            project_id: self.config.project_id.as_deref(),
            source: &spec.source,
            resources: Resources { vcpus: spec.vcpus },
            timeout: spec.lifetime.as_millis() as u64,
            ports: &spec.ports,
            runtime: &spec.runtime,
        };
        let resp = self
            .request(Method::POST, "/v1/sandboxes")
            .json(&body)
            .send()
            .await?;
        let envelope: SandboxEnvelope = check(resp, "").await?.json().await?;
        debug!(sandbox_id = %envelope.sandbox.id, "provider created environment");
        Ok(EnvironmentHandle::new(envelope.sandbox.id))
    }

    async fn run_command(
        &self,
        env: &EnvironmentHandle,
        command: &CommandSpec,
    ) -> Result<ExitResult, ProviderError> {
        let body = RunCommandRequest {
            command: &command.cmd,
            args: &command.args,
            sudo: command.sudo,
        };
        let resp = self
            .request(Method::POST, &format!("/v1/sandboxes/{}/cmd", env.id))
            .json(&body)
            .send()
            .await?;
        let started: CommandEnvelope = check(resp, &env.id).await?.json().await?;
        if command.detached {
            return Ok(ExitResult { exit_code: None });
        }

        let resp = self
            .request(
                Method::GET,
                &format!("/v1/sandboxes/{}/cmd/{}", env.id, started.command.id),
            )
            .query(&[("wait", "true")])
            .send()
            .await?;
        let finished: CommandEnvelope = check(resp, &env.id).await?.json().await?;
        match finished.command.exit_code {
            Some(code) => Ok(ExitResult {
                exit_code: Some(code),
            }),
            None => {
                warn!(sandbox_id = %env.id, command = %command.cmd, "command finished without exit code");
                Err(ProviderError::Decode(format!(
                    "command {} reported no exit code",
                    started.command.id
                )))
            }
        }
    }

    async fn exposed_url(
        &self,
        env: &EnvironmentHandle,
        port: u16,
    ) -> Result<String, ProviderError> {
        let envelope = self.fetch(&env.id).await?;
        let route = envelope
            .routes
            .into_iter()
            .find(|r| r.port == port)
            .ok_or_else(|| ProviderError::Decode(format!("no route for port {}", port)))?;
        match (route.url, route.subdomain) {
            (Some(url), _) => Ok(url),
            (None, Some(subdomain)) => Ok(format!("https://{}", subdomain)),
            (None, None) => Err(ProviderError::Decode(format!(
                "route for port {} has no address",
                port
            ))),
        }
    }

    async fn stop(&self, env: &EnvironmentHandle) -> Result<(), ProviderError> {
        let resp = self
            .request(Method::POST, &format!("/v1/sandboxes/{}/stop", env.id))
            .send()
            .await?;
        check(resp, &env.id).await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<EnvironmentHandle, ProviderError> {
        let envelope = self.fetch(id).await?;
        Ok(EnvironmentHandle::new(envelope.sandbox.id))
    }
}
