use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use notepilot_core_types::BoundedRing;
use notepilot_event_bus::EventBus;

/// Transitions retained for diagnostics.
pub const HISTORY_CAPACITY: usize = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
    Error,
}

impl AuthState {
    pub const ALL: [AuthState; 5] = [
        AuthState::Unauthenticated,
        AuthState::Authenticating,
        AuthState::Authenticated,
        AuthState::Expired,
        AuthState::Error,
    ];
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Authenticating => "authenticating",
            AuthState::Authenticated => "authenticated",
            AuthState::Expired => "expired",
            AuthState::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    StartAuth,
    AuthSuccess,
    AuthFailed,
    CookiesExpired,
    StateLoaded,
    StateCleared,
    Logout,
}

impl AuthEvent {
    pub const ALL: [AuthEvent; 7] = [
        AuthEvent::StartAuth,
        AuthEvent::AuthSuccess,
        AuthEvent::AuthFailed,
        AuthEvent::CookiesExpired,
        AuthEvent::StateLoaded,
        AuthEvent::StateCleared,
        AuthEvent::Logout,
    ];

    /// Event-specific bus notification published alongside the generic
    /// `auth:state_changed`.
    pub fn notification(self) -> &'static str {
        match self {
            AuthEvent::StartAuth => "auth:started",
            AuthEvent::AuthSuccess => "auth:succeeded",
            AuthEvent::AuthFailed => "auth:failed",
            AuthEvent::CookiesExpired => "auth:expired",
            AuthEvent::StateLoaded => "auth:loaded",
            AuthEvent::StateCleared => "auth:cleared",
            AuthEvent::Logout => "auth:logged_out",
        }
    }
}

impl fmt::Display for AuthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AuthEvent::StartAuth => "START_AUTH",
            AuthEvent::AuthSuccess => "AUTH_SUCCESS",
            AuthEvent::AuthFailed => "AUTH_FAILED",
            AuthEvent::CookiesExpired => "COOKIES_EXPIRED",
            AuthEvent::StateLoaded => "STATE_LOADED",
            AuthEvent::StateCleared => "STATE_CLEARED",
            AuthEvent::Logout => "LOGOUT",
        };
        f.write_str(label)
    }
}

/// The fixed transition table. Pairs absent here are illegal and rejected by
/// [`AuthCenter::dispatch`] without state change.
pub fn transition(state: AuthState, event: AuthEvent) -> Option<AuthState> {
    use AuthEvent::*;
    use AuthState::*;
    match (state, event) {
        (Unauthenticated, StartAuth) => Some(Authenticating),
        (Unauthenticated, StateLoaded) => Some(Authenticated),
        (Authenticating, AuthSuccess) => Some(Authenticated),
        (Authenticating, AuthFailed) => Some(Error),
        (Authenticating, StateCleared) => Some(Unauthenticated),
        (Authenticated, CookiesExpired) => Some(Expired),
        (Authenticated, Logout) => Some(Unauthenticated),
        (Authenticated, StateCleared) => Some(Unauthenticated),
        (Expired, StartAuth) => Some(Authenticating),
        (Expired, StateCleared) => Some(Unauthenticated),
        (Error, StartAuth) => Some(Authenticating),
        (Error, StateCleared) => Some(Unauthenticated),
        _ => None,
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TransitionRecord {
    pub state: AuthState,
    pub event: AuthEvent,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AuthSnapshot {
    pub state: AuthState,
    pub is_authenticated: bool,
    pub needs_reauth: bool,
    pub last_event: Option<AuthEvent>,
    pub history_length: usize,
}

struct AuthInner {
    state: AuthState,
    last_event: Option<AuthEvent>,
    history: BoundedRing<TransitionRecord>,
}

/// Single authoritative source of authentication state. All mutations go
/// through `dispatch`/`force_state`, serialized by an async lock; readers see
/// the latest committed state without queueing behind dispatches.
pub struct AuthCenter {
    inner: RwLock<AuthInner>,
    gate: Mutex<()>,
    bus: Option<Arc<EventBus>>,
}

impl AuthCenter {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_bus(bus: Arc<EventBus>) -> Self {
        Self::build(Some(bus))
    }

    fn build(bus: Option<Arc<EventBus>>) -> Self {
        Self {
            inner: RwLock::new(AuthInner {
                state: AuthState::Unauthenticated,
                last_event: None,
                history: BoundedRing::new(HISTORY_CAPACITY),
            }),
            gate: Mutex::new(()),
            bus,
        }
    }

    /// Applies `event` if the table allows it from the current state.
    /// Returns `false` (leaving state untouched) otherwise. Racing dispatches
    /// are serialized; losers observe the winner's post-state and get
    /// rejected rather than queued for retry.
    pub async fn dispatch(&self, event: AuthEvent, payload: Option<serde_json::Value>) -> bool {
        let _guard = self.gate.lock().await;
        let current = self.inner.read().state;
        let Some(next) = transition(current, event) else {
            warn!(state = %current, event = %event, "rejected illegal auth transition");
            return false;
        };

        {
            let mut inner = self.inner.write();
            inner.state = next;
            inner.last_event = Some(event);
            inner.history.push(TransitionRecord {
                state: next,
                event,
                timestamp: Utc::now(),
            });
        }
        debug!(from = %current, to = %next, event = %event, "auth transition");

        if let Some(bus) = &self.bus {
            let detail = json!({
                "from": current,
                "to": next,
                "event": event,
                "payload": payload,
            });
            bus.publish("auth:state_changed", detail.clone()).await;
            bus.publish(event.notification(), detail).await;
        }
        true
    }

    /// Administrative override bypassing the transition table. Recovery path
    /// only; always warns.
    pub async fn force_state(&self, state: AuthState, reason: &str) {
        let _guard = self.gate.lock().await;
        let previous = {
            let mut inner = self.inner.write();
            std::mem::replace(&mut inner.state, state)
        };
        warn!(from = %previous, to = %state, reason, "auth state forced outside transition table");

        if let Some(bus) = &self.bus {
            bus.publish(
                "auth:state_changed",
                json!({ "from": previous, "to": state, "forced": true, "reason": reason }),
            )
            .await;
        }
    }

    pub fn state(&self) -> AuthState {
        self.inner.read().state
    }

    /// Non-mutating table lookup against the current state; may be stale
    /// under a concurrent dispatch.
    pub fn can_transition(&self, event: AuthEvent) -> bool {
        transition(self.state(), event).is_some()
    }

    pub fn next_state(&self, event: AuthEvent) -> Option<AuthState> {
        transition(self.state(), event)
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == AuthState::Authenticated
    }

    pub fn is_authenticating(&self) -> bool {
        self.state() == AuthState::Authenticating
    }

    pub fn needs_reauth(&self) -> bool {
        matches!(
            self.state(),
            AuthState::Unauthenticated | AuthState::Expired | AuthState::Error
        )
    }

    pub fn last_event(&self) -> Option<AuthEvent> {
        self.inner.read().last_event
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.inner.read().history.snapshot()
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        let inner = self.inner.read();
        AuthSnapshot {
            state: inner.state,
            is_authenticated: inner.state == AuthState::Authenticated,
            needs_reauth: matches!(
                inner.state,
                AuthState::Unauthenticated | AuthState::Expired | AuthState::Error
            ),
            last_event: inner.last_event,
            history_length: inner.history.len(),
        }
    }
}

impl Default for AuthCenter {
    fn default() -> Self {
        Self::new()
    }
}
