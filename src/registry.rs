//! In-memory table of active sandbox sessions.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Derived liveness of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Expired,
    Stopped,
    NotFound,
}

/// A provisioned sandbox with a reachable terminal. Fields are write-once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSession {
    pub id: String,
    pub terminal_url: String,
    pub created_at: SystemTime,
    pub max_duration: Duration,
}

impl SandboxSession {
    pub fn new(id: String, terminal_url: String, max_duration: Duration) -> Self {
        Self {
            id,
            terminal_url,
            created_at: SystemTime::now(),
            max_duration,
        }
    }

    /// Instant after which the session can no longer be running.
    /// `None` when the lifetime runs past what `SystemTime` can represent.
    pub fn deadline(&self) -> Option<SystemTime> {
        self.created_at.checked_add(self.max_duration)
    }

    pub fn remaining_at(&self, now: SystemTime) -> Duration {
        remaining(self.created_at, self.max_duration, now)
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    pub fn status_at(&self, now: SystemTime) -> SessionStatus {
        if self.is_expired_at(now) {
            SessionStatus::Expired
        } else {
            SessionStatus::Running
        }
    }
}

/// Time left on a session, clamped at zero.
pub fn remaining(created_at: SystemTime, max_duration: Duration, now: SystemTime) -> Duration {
    // A clock behind `created_at` counts as zero elapsed.
    let elapsed = now.duration_since(created_at).unwrap_or_default();
    max_duration.saturating_sub(elapsed)
}

/// Milliseconds since the Unix epoch, as sent over the wire.
pub fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn from_unix_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

#[derive(Default)]
struct Table {
    sessions: HashMap<String, SandboxSession>,
    /// Ids with a provider stop in flight.
    stopping: HashSet<String>,
}

/// Thread-safe session storage.
///
/// Every operation takes the lock for a single map access and never
/// across an await on the provider.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    table: Arc<RwLock<Table>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session. Fails if the id is already present.
    pub async fn put(&self, session: SandboxSession) -> Result<()> {
        let mut table = self.table.write().await;
        if table.sessions.contains_key(&session.id) {
            return Err(Error::AlreadyExists(session.id));
        }
        table.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<SandboxSession> {
        self.table.read().await.sessions.get(id).cloned()
    }

    /// Remove a session. Removing an absent id is a no-op.
    pub async fn remove(&self, id: &str) -> Option<SandboxSession> {
        let mut table = self.table.write().await;
        table.stopping.remove(id);
        table.sessions.remove(id)
    }

    /// Claim `id` for stopping. `None` if it is absent or another stop
    /// already holds it. The session stays visible until [`finish_stop`].
    ///
    /// [`finish_stop`]: SessionRegistry::finish_stop
    pub async fn begin_stop(&self, id: &str) -> Option<SandboxSession> {
        let mut table = self.table.write().await;
        let session = table.sessions.get(id).cloned()?;
        if !table.stopping.insert(id.to_string()) {
            return None;
        }
        Some(session)
    }

    /// The provider confirmed the stop: drop the session and the claim.
    pub async fn finish_stop(&self, id: &str) {
        self.remove(id).await;
    }

    /// The provider stop failed: release the claim, keep the session.
    pub async fn abort_stop(&self, id: &str) {
        self.table.write().await.stopping.remove(id);
    }

    pub async fn list(&self) -> Vec<SandboxSession> {
        let mut list: Vec<SandboxSession> =
            self.table.read().await.sessions.values().cloned().collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> SandboxSession {
        SandboxSession::new(
            id.to_string(),
            format!("https://{id}.example.dev"),
            Duration::from_secs(1800),
        )
    }

    #[tokio::test]
    async fn put_then_get() {
        let registry = SessionRegistry::new();
        registry.put(session("sbx_1")).await.unwrap();

        let found = registry.get("sbx_1").await.unwrap();
        assert_eq!(found.terminal_url, "https://sbx_1.example.dev");
        assert!(registry.get("sbx_2").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_put_is_rejected() {
        let registry = SessionRegistry::new();
        registry.put(session("sbx_1")).await.unwrap();

        let err = registry.put(session("sbx_1")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(id) if id == "sbx_1"));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.put(session("sbx_1")).await.unwrap();

        assert!(registry.remove("sbx_1").await.is_some());
        assert!(registry.remove("sbx_1").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_puts_all_land() {
        let registry = SessionRegistry::new();
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.put(session(&format!("sbx_{i}"))).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(registry.len().await, 32);
    }

    #[tokio::test]
    async fn only_one_stop_can_claim_a_session() {
        let registry = SessionRegistry::new();
        registry.put(session("sbx_1")).await.unwrap();

        assert!(registry.begin_stop("sbx_1").await.is_some());
        assert!(registry.begin_stop("sbx_1").await.is_none());
        assert!(registry.get("sbx_1").await.is_some());

        registry.abort_stop("sbx_1").await;
        assert!(registry.begin_stop("sbx_1").await.is_some());
        registry.finish_stop("sbx_1").await;

        assert!(registry.get("sbx_1").await.is_none());
        assert!(registry.begin_stop("sbx_1").await.is_none());
        assert!(registry.begin_stop("sbx_missing").await.is_none());
    }

    #[test]
    fn remaining_is_clamped() {
        let t = from_unix_millis(1_000_000);
        let max = Duration::from_millis(1_800_000);

        assert_eq!(
            remaining(t, max, t + Duration::from_millis(1_700_000)),
            Duration::from_millis(100_000)
        );
        assert_eq!(remaining(t, max, t + max), Duration::ZERO);
        assert_eq!(remaining(t, max, t + max * 2), Duration::ZERO);
        assert_eq!(remaining(t, max, t - Duration::from_secs(5)), max);
    }

    #[test]
    fn status_flips_at_deadline() {
        let s = session("sbx_1");
        assert_eq!(s.status_at(s.created_at), SessionStatus::Running);
        assert_eq!(s.status_at(s.deadline().unwrap()), SessionStatus::Expired);
    }

    #[test]
    fn unrepresentable_deadline_never_expires() {
        let s = SandboxSession::new("sbx_1".to_string(), "https://x".to_string(), Duration::MAX);

        assert_eq!(s.deadline(), None);
        assert!(!s.is_expired_at(s.created_at + Duration::from_secs(10 * 365 * 24 * 3600)));
        assert_eq!(s.status_at(SystemTime::now()), SessionStatus::Running);
        assert!(s.remaining_at(SystemTime::now()) > Duration::ZERO);
    }

    #[test]
    fn millis_round_trip_is_stable() {
        assert_eq!(unix_millis(from_unix_millis(1_700_000_123)), 1_700_000_123);
    }
}
