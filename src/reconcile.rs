//! Client side of status reconciliation.
//!
//! A [`SessionTracker`] holds the client's advisory copy of a session.
//! Between polls it extrapolates the remaining time locally; only a server
//! answer of `exists: false` ends the session. Reaching zero locally marks
//! the session as probably expired and nothing more.

use crate::registry::{from_unix_millis, remaining};
use crate::status::SandboxStatus;
use std::time::{Duration, SystemTime};

/// Client-observed state of a session.
///
/// `Absent` is terminal: once the server confirms the session is gone
/// nothing leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// An id is known but the server has not answered yet.
    Unknown,
    /// Created, timing not yet known.
    Pending,
    Running { remaining: Duration },
    /// Local countdown reached zero; the server has not confirmed.
    Expired,
    Absent,
}

impl ClientState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientState::Absent)
    }
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    created_at: SystemTime,
    max_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionTracker {
    id: Option<String>,
    terminal_url: Option<String>,
    timing: Option<Timing>,
    state: ClientState,
}

impl SessionTracker {
    /// Track a session known only by id, e.g. restored from a link.
    pub fn resume(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            terminal_url: None,
            timing: None,
            state: ClientState::Unknown,
        }
    }

    /// Track a session this client just created.
    pub fn created(id: impl Into<String>, terminal_url: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            terminal_url: Some(terminal_url.into()),
            timing: None,
            state: ClientState::Pending,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn terminal_url(&self) -> Option<&str> {
        self.terminal_url.as_deref()
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Remaining time as of `now`, if the timing is known.
    pub fn remaining(&self, now: SystemTime) -> Option<Duration> {
        self.timing
            .map(|t| remaining(t.created_at, t.max_duration, now))
    }

    /// Fold a server answer into the local view.
    pub fn apply(&mut self, status: &SandboxStatus, now: SystemTime) -> ClientState {
        if self.state.is_terminal() {
            return self.state;
        }
        if !status.exists {
            self.id = None;
            self.terminal_url = None;
            self.timing = None;
            self.state = ClientState::Absent;
            return self.state;
        }

        if let Some(url) = &status.terminal_url {
            self.terminal_url = Some(url.clone());
        }
        if let (Some(created_at), Some(max_duration)) = (status.created_at, status.max_duration) {
            self.timing = Some(Timing {
                created_at: from_unix_millis(created_at),
                max_duration: Duration::from_millis(max_duration),
            });
        }
        self.tick(now)
    }

    /// Recompute the countdown without contacting the server.
    pub fn tick(&mut self, now: SystemTime) -> ClientState {
        if self.state.is_terminal() {
            return self.state;
        }
        if let Some(left) = self.remaining(now) {
            self.state = if left.is_zero() {
                ClientState::Expired
            } else {
                ClientState::Running { remaining: left }
            };
        } else if self.terminal_url.is_some() {
            self.state = ClientState::Pending;
        }
        self.state
    }
}
