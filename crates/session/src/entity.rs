use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use notepilot_core_types::SessionId;

use crate::errors::SessionError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Processing,
    Waiting,
    Error,
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Processing => "processing",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Error => "error",
            SessionStatus::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn now(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Fixed at session creation; never changed by transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    pub notebook_url: String,
    pub headless: bool,
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            notebook_url: String::new(),
            headless: true,
            timeout: Duration::from_secs(120),
        }
    }
}

impl SessionConfig {
    pub fn new(notebook_url: impl Into<String>) -> Self {
        Self {
            notebook_url: notebook_url.into(),
            ..Self::default()
        }
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One conversation's state. Immutable: every transition returns a fresh
/// entity and leaves the receiver untouched; the owning actor swaps the
/// current reference.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionEntity {
    pub id: SessionId,
    pub config: SessionConfig,
    pub status: SessionStatus,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl SessionEntity {
    pub fn new(config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            config,
            status: SessionStatus::Idle,
            messages: Vec::new(),
            created_at: now,
            last_activity_at: now,
            error_message: None,
        }
    }

    pub fn can_accept_message(&self) -> bool {
        self.status == SessionStatus::Idle
    }

    /// Appends the user message and moves to `processing`.
    pub fn start_processing(&self, text: &str) -> Result<Self, SessionError> {
        if !self.can_accept_message() {
            return Err(SessionError::NotAccepting {
                current: self.status,
            });
        }
        let mut next = self.clone();
        next.messages.push(Message::now(Role::User, text));
        next.status = SessionStatus::Processing;
        next.last_activity_at = Utc::now();
        Ok(next)
    }

    pub fn start_waiting(&self) -> Result<Self, SessionError> {
        if self.status != SessionStatus::Processing {
            return Err(SessionError::InvalidTransition {
                current: self.status,
                target: SessionStatus::Waiting,
            });
        }
        let mut next = self.clone();
        next.status = SessionStatus::Waiting;
        Ok(next)
    }

    /// Appends the assistant response, returns to `idle` and clears any prior
    /// error.
    pub fn complete_with_response(&self, text: &str) -> Result<Self, SessionError> {
        if !matches!(
            self.status,
            SessionStatus::Waiting | SessionStatus::Processing
        ) {
            return Err(SessionError::InvalidTransition {
                current: self.status,
                target: SessionStatus::Idle,
            });
        }
        let mut next = self.clone();
        next.messages.push(Message::now(Role::Assistant, text));
        next.status = SessionStatus::Idle;
        next.error_message = None;
        next.last_activity_at = Utc::now();
        Ok(next)
    }

    /// Legal from any status; existing messages are preserved.
    pub fn mark_error(&self, message: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.status = SessionStatus::Error;
        next.error_message = Some(message.into());
        next.last_activity_at = Utc::now();
        next
    }

    pub fn reset(&self) -> Self {
        let mut next = self.clone();
        next.messages.clear();
        next.status = SessionStatus::Idle;
        next.error_message = None;
        next.last_activity_at = Utc::now();
        next
    }

    /// Terminal status; the message log survives for inspection.
    pub fn close(&self) -> Self {
        let mut next = self.clone();
        next.status = SessionStatus::Closed;
        next.last_activity_at = Utc::now();
        next
    }

    pub fn touch(&self) -> Self {
        let mut next = self.clone();
        next.last_activity_at = Utc::now();
        next
    }

    pub fn age_seconds(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds().max(0)
    }

    pub fn inactive_seconds(&self) -> i64 {
        (Utc::now() - self.last_activity_at).num_seconds().max(0)
    }

    /// Plain-data round trip for persistence collaborators.
    pub fn to_snapshot(&self) -> Result<serde_json::Value, SessionError> {
        serde_json::to_value(self).map_err(|err| SessionError::Snapshot(err.to_string()))
    }

    pub fn from_snapshot(value: serde_json::Value) -> Result<Self, SessionError> {
        serde_json::from_value(value).map_err(|err| SessionError::Snapshot(err.to_string()))
    }

    /// API-shaped projection. The snake_case keys (`age_seconds`,
    /// `inactive_seconds`, `message_count`) are an external contract.
    pub fn to_info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.0.clone(),
            notebook_url: self.config.notebook_url.clone(),
            status: self.status,
            message_count: self.messages.len(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            age_seconds: self.age_seconds(),
            inactive_seconds: self.inactive_seconds(),
            error: self.error_message.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub notebook_url: String,
    pub status: SessionStatus,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub age_seconds: i64,
    pub inactive_seconds: i64,
    pub error: Option<String>,
}
