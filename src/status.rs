//! Server side of status reconciliation.
//!
//! Status reads answer from the registry. Entries past their deadline are
//! dropped on read, and with `verify_on_read` the provider is asked whether
//! the environment still exists.

use crate::error::ProviderError;
use crate::registry::{unix_millis, SandboxSession, SessionStatus};
use crate::state::AppState;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tracing::{info, warn};

/// Answer to `sandbox.getStatus`. Absence is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub exists: bool,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_url: Option<String>,
    /// Unix epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<u64>,
}

impl SandboxStatus {
    pub fn absent() -> Self {
        Self {
            exists: false,
            status: SessionStatus::NotFound,
            terminal_url: None,
            created_at: None,
            max_duration: None,
        }
    }

    pub fn present(session: &SandboxSession) -> Self {
        Self {
            exists: true,
            status: SessionStatus::Running,
            terminal_url: Some(session.terminal_url.clone()),
            created_at: Some(unix_millis(session.created_at)),
            max_duration: Some(session.max_duration.as_millis() as u64),
        }
    }
}

pub async fn get_status(state: &AppState, id: &str) -> SandboxStatus {
    get_status_at(state, id, SystemTime::now()).await
}

/// Status of `id` as of `now`.
pub async fn get_status_at(state: &AppState, id: &str, now: SystemTime) -> SandboxStatus {
    if id.is_empty() {
        return SandboxStatus::absent();
    }
    let Some(session) = state.registry.get(id).await else {
        return SandboxStatus::absent();
    };

    if session.is_expired_at(now) {
        state.registry.remove(id).await;
        info!(sandbox_id = %id, "sandbox expired, removed from registry");
        return SandboxStatus::absent();
    }

    if state.config.verify_on_read {
        match state.provider.get(id).await {
            Ok(_) => {}
            Err(ProviderError::NotFound(_)) => {
                state.registry.remove(id).await;
                info!(sandbox_id = %id, "sandbox gone at provider, removed from registry");
                return SandboxStatus::absent();
            }
            Err(e) => {
                warn!(sandbox_id = %id, error = %e, "could not verify sandbox, answering from registry");
            }
        }
    }

    SandboxStatus::present(&session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::provider::MemoryProvider;
    use crate::provisioning::create_sandbox;
    use crate::registry::from_unix_millis;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(config: SandboxConfig) -> (AppState, Arc<MemoryProvider>) {
        let provider = Arc::new(MemoryProvider::default());
        (AppState::new(provider.clone(), config), provider)
    }

    #[tokio::test]
    async fn empty_id_is_absent() {
        let (state, _) = setup(SandboxConfig::default());
        assert_eq!(get_status(&state, "").await, SandboxStatus::absent());
    }

    #[tokio::test]
    async fn unknown_id_is_absent() {
        let (state, _) = setup(SandboxConfig::default());
        let status = get_status(&state, "sbx_never_issued").await;
        assert!(!status.exists);
        assert_eq!(status.terminal_url, None);
    }

    #[tokio::test]
    async fn running_session_reports_timing() {
        let (state, provider) = setup(SandboxConfig::default());
        let t = from_unix_millis(1_700_000_000_000);
        let session = SandboxSession {
            id: "sbx_1".to_string(),
            terminal_url: "https://sbx_1-7681.sandbox.localhost".to_string(),
            created_at: t,
            max_duration: Duration::from_millis(1_800_000),
        };
        state.registry.put(session).await.unwrap();

        let status = get_status_at(&state, "sbx_1", t + Duration::from_millis(1_700_000)).await;

        assert!(status.exists);
        assert_eq!(status.status, SessionStatus::Running);
        assert_eq!(status.created_at, Some(1_700_000_000_000));
        assert_eq!(status.max_duration, Some(1_800_000));
        assert!(provider.calls().await.is_empty());
    }

    #[tokio::test]
    async fn expired_session_is_removed_on_read() {
        let (state, _) = setup(SandboxConfig::default());
        let created = create_sandbox(&state, "octocat", "hello-world").await.unwrap();
        let session = state.registry.get(&created.id).await.unwrap();

        let status = get_status_at(&state, &created.id, session.deadline().unwrap()).await;

        assert!(!status.exists);
        assert!(state.registry.get(&created.id).await.is_none());
    }

    #[tokio::test]
    async fn unbounded_lifetime_reads_as_running() {
        let config = SandboxConfig {
            max_duration: Duration::MAX,
            ..SandboxConfig::default()
        };
        let (state, _) = setup(config);
        let created = create_sandbox(&state, "octocat", "hello-world").await.unwrap();

        let status = get_status(&state, &created.id).await;

        assert!(status.exists);
        assert_eq!(status.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn provider_expiry_detected_when_verifying() {
        let config = SandboxConfig {
            verify_on_read: true,
            ..SandboxConfig::default()
        };
        let (state, provider) = setup(config);
        let created = create_sandbox(&state, "octocat", "hello-world").await.unwrap();

        assert!(get_status(&state, &created.id).await.exists);
        provider.expire(&created.id).await;
        assert!(!get_status(&state, &created.id).await.exists);
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn registry_trusted_without_verification() {
        let (state, provider) = setup(SandboxConfig::default());
        let created = create_sandbox(&state, "octocat", "hello-world").await.unwrap();
        provider.expire(&created.id).await;

        // Stale-positive until the next stop or verified read.
        assert!(get_status(&state, &created.id).await.exists);
    }

    #[test]
    fn absent_serializes_without_optional_fields() {
        let json = serde_json::to_value(SandboxStatus::absent()).unwrap();
        assert_eq!(json, serde_json::json!({ "exists": false, "status": "not_found" }));
    }
}
