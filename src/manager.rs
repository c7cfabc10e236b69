use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tracing::{info, warn};

use notepilot_core_types::SessionId;
use notepilot_event_bus::EventBus;
use notepilot_session::{ActorInfo, QuestionHandler, SessionActor, SessionConfig};

use crate::config::ManagerConfig;
use crate::errors::Error;

/// Registry of live session actors, one per logical conversation. Owns the
/// shared event bus and hands it to every actor it creates; the question
/// handler (the automation collaborator) is injected once and shared.
pub struct SessionManager {
    config: ManagerConfig,
    handler: Option<Arc<dyn QuestionHandler>>,
    bus: Arc<EventBus>,
    sessions: DashMap<SessionId, Arc<SessionActor>>,
}

impl SessionManager {
    pub fn new(config: ManagerConfig, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            handler: None,
            bus,
            sessions: DashMap::new(),
        }
    }

    pub fn with_question_handler(mut self, handler: Arc<dyn QuestionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Spawns a new session actor, with `overrides` replacing the configured
    /// defaults when given.
    pub async fn create_session(&self, overrides: Option<SessionConfig>) -> Arc<SessionActor> {
        let config = overrides.unwrap_or_else(|| self.config.defaults.clone());
        let actor = SessionActor::build(config, self.handler.clone(), Some(Arc::clone(&self.bus)));
        self.sessions.insert(actor.id().clone(), Arc::clone(&actor));
        self.bus
            .publish(
                "manager:session_created",
                json!({ "session_id": actor.id().0, "total": self.sessions.len() }),
            )
            .await;
        actor
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<SessionActor>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn list(&self) -> Vec<ActorInfo> {
        self.sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    /// Closes the actor and drops it from the registry.
    pub async fn remove_session(&self, id: &SessionId) -> Result<(), Error> {
        let Some((_, actor)) = self.sessions.remove(id) else {
            return Err(Error::UnknownSession(id.clone()));
        };
        actor.close().await?;
        self.bus
            .publish(
                "manager:session_removed",
                json!({ "session_id": id.0, "total": self.sessions.len() }),
            )
            .await;
        Ok(())
    }

    /// Closes sessions idle for at least the configured `reap_after` window
    /// with nothing queued. The host calls this on its own schedule; the
    /// kernel owns no timer. Returns how many were removed.
    pub async fn reap_idle(&self) -> usize {
        let cutoff = self.config.reap_after.as_secs() as i64;
        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.value().pending_messages() == 0
                    && entry.value().state().inactive_seconds() >= cutoff
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for id in idle {
            match self.remove_session(&id).await {
                Ok(()) => reaped += 1,
                Err(err) => warn!(session = %id, error = %err, "failed to reap idle session"),
            }
        }
        if reaped > 0 {
            info!(reaped, "reaped idle sessions");
        }
        reaped
    }

    /// Closes every actor. Used at process shutdown, after which the shared
    /// context pool is expected to be force-closed by the host.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<SessionActor>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.sessions.clear();

        for actor in drained {
            if let Err(err) = actor.close().await {
                warn!(session = %actor.id(), error = %err, "session close failed during shutdown");
            }
        }
        self.bus.publish("manager:shutdown", json!({})).await;
    }
}
