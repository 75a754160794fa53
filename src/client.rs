//! HTTP client for the sandbox API and the polling watch loop.

use crate::provisioning::CreatedSandbox;
use crate::reconcile::{ClientState, SessionTracker};
use crate::status::SandboxStatus;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{code}: {message}")]
    Api { code: String, message: String },
}

#[derive(Deserialize)]
struct ApiErrorBody {
    code: String,
    message: String,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    owner: &'a str,
    repo: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest<'a> {
    sandbox_id: &'a str,
}

#[derive(Deserialize)]
struct StopResponse {
    success: bool,
}

/// Shortest tick or poll period `watch` runs with.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Polling cadence for [`SandboxClient::watch`].
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Local countdown refresh.
    pub tick: Duration,
    /// Server status poll.
    pub poll: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            poll: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct SandboxClient {
    http: Client,
    base_url: String,
}

async fn decode<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T, ClientError> {
    if resp.status().is_success() {
        return Ok(resp.json().await?);
    }
    let status = resp.status();
    match resp.json::<ApiErrorBody>().await {
        Ok(body) => Err(ClientError::Api {
            code: body.code,
            message: body.message,
        }),
        Err(_) => Err(ClientError::Api {
            code: status.as_u16().to_string(),
            message: status.canonical_reason().unwrap_or("error").to_string(),
        }),
    }
}

impl SandboxClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn create(&self, owner: &str, repo: &str) -> Result<CreatedSandbox, ClientError> {
        let resp = self
            .http
            .post(self.url("/api/sandbox.create"))
            .json(&CreateRequest { owner, repo })
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn stop(&self, id: &str) -> Result<bool, ClientError> {
        let resp = self
            .http
            .post(self.url("/api/sandbox.stop"))
            .json(&StopRequest { sandbox_id: id })
            .send()
            .await?;
        let body: StopResponse = decode(resp).await?;
        Ok(body.success)
    }

    pub async fn status(&self, id: &str) -> Result<SandboxStatus, ClientError> {
        let resp = self
            .http
            .get(self.url("/api/sandbox.getStatus"))
            .query(&[("sandboxId", id)])
            .send()
            .await?;
        decode(resp).await
    }

    /// Status read that gives up after `timeout`.
    async fn poll_status(&self, id: &str, timeout: Duration) -> Result<SandboxStatus, ClientError> {
        let resp = self
            .http
            .get(self.url("/api/sandbox.getStatus"))
            .query(&[("sandboxId", id)])
            .timeout(timeout)
            .send()
            .await?;
        decode(resp).await
    }

    /// Follow `tracker` until the server confirms the session is gone.
    ///
    /// `on_update` sees the state after every tick and every poll. Failed
    /// polls are logged and retried on the next interval; they never end
    /// the session. A poll runs in the background and is cut off after one
    /// poll period, so the countdown keeps ticking while the server is slow.
    pub async fn watch<F>(
        &self,
        tracker: &mut SessionTracker,
        options: WatchOptions,
        mut on_update: F,
    ) -> ClientState
    where
        F: FnMut(&SessionTracker),
    {
        let Some(id) = tracker.id().map(str::to_string) else {
            return tracker.state();
        };
        let tick_period = options.tick.max(MIN_PERIOD);
        let poll_period = options.poll.max(MIN_PERIOD);

        let mut tick = interval(tick_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = interval(poll_period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (tx, mut rx) = mpsc::channel::<Result<SandboxStatus, ClientError>>(1);
        let mut in_flight = false;

        loop {
            tokio::select! {
                _ = poll.tick(), if !in_flight => {
                    in_flight = true;
                    let client = self.clone();
                    let id = id.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let result = client.poll_status(&id, poll_period).await;
                        let _ = tx.send(result).await;
                    });
                    continue;
                }
                Some(result) = rx.recv() => {
                    in_flight = false;
                    match result {
                        Ok(status) => {
                            debug!(sandbox_id = %id, exists = status.exists, "polled status");
                            tracker.apply(&status, SystemTime::now());
                        }
                        Err(e) => warn!(sandbox_id = %id, error = %e, "status poll failed"),
                    }
                }
                _ = tick.tick() => {
                    tracker.tick(SystemTime::now());
                }
            }
            on_update(tracker);
            if tracker.state().is_terminal() {
                return tracker.state();
            }
        }
    }
}
