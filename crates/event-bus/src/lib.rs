use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

use notepilot_core_types::BoundedRing;

/// Events kept in the diagnostic history before oldest-eviction kicks in.
pub const HISTORY_CAPACITY: usize = 100;

const GLOBAL_WILDCARD: &str = "*";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("timed out after {timeout_ms}ms waiting for {event_type}")]
    WaitTimeout { event_type: String, timeout_ms: u64 },
    #[error("event bus dropped while waiting for {event_type}")]
    BusGone { event_type: String },
}

/// Attached to every delivery alongside the payload.
#[derive(Clone, Debug, Serialize)]
pub struct EventMetadata {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct BusEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: EventMetadata,
}

pub type EventHandler =
    Arc<dyn Fn(serde_json::Value, EventMetadata) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure into the boxed handler shape the bus stores.
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(serde_json::Value, EventMetadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |payload, metadata| Box::pin(f(payload, metadata)))
}

struct Subscriber {
    id: u64,
    handler: EventHandler,
    once: bool,
}

type SubscriberTable = DashMap<String, Vec<Subscriber>>;

/// Handle returned by every subscribe variant. `unsubscribe` is idempotent
/// and never disturbs other registrations under the same key.
pub struct Subscription {
    key: String,
    id: u64,
    table: Weak<SubscriberTable>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(table) = self.table.upgrade() {
            if let Some(mut entry) = table.get_mut(&self.key) {
                entry.retain(|sub| sub.id != self.id);
            }
        }
    }
}

/// Process-wide publish/subscribe hub with three dispatch tiers: exact event
/// type, category wildcard (`"<category>:*"`) and global wildcard (`"*"`).
/// Exact handlers are awaited by `publish`; the wildcard tiers are spawned
/// and run independently.
pub struct EventBus {
    subscribers: Arc<SubscriberTable>,
    events: Mutex<BoundedRing<BusEvent>>,
    correlation: RwLock<Option<String>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Arc::new(DashMap::new()),
            events: Mutex::new(BoundedRing::new(capacity)),
            correlation: RwLock::new(None),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn subscribe(&self, event_type: impl Into<String>, handler: EventHandler) -> Subscription {
        self.register(event_type.into(), handler, false)
    }

    pub fn subscribe_to_category(
        &self,
        category: impl AsRef<str>,
        handler: EventHandler,
    ) -> Subscription {
        self.register(format!("{}:*", category.as_ref()), handler, false)
    }

    pub fn subscribe_to_all(&self, handler: EventHandler) -> Subscription {
        self.register(GLOBAL_WILDCARD.to_string(), handler, false)
    }

    /// Auto-unsubscribes after the first delivery.
    pub fn once(&self, event_type: impl Into<String>, handler: EventHandler) -> Subscription {
        self.register(event_type.into(), handler, true)
    }

    pub async fn publish(&self, event_type: impl Into<String>, payload: serde_json::Value) {
        let event_type = event_type.into();
        let metadata = EventMetadata {
            event_type: event_type.clone(),
            timestamp: Utc::now(),
            correlation_id: self.correlation.read().clone(),
        };
        self.events.lock().push(BusEvent {
            event_type: event_type.clone(),
            payload: payload.clone(),
            metadata: metadata.clone(),
        });

        let exact = self.drain_tier(&event_type);
        let category = match category_key(&event_type) {
            Some(key) => self.drain_tier(&key),
            None => Vec::new(),
        };
        let global = self.drain_tier(GLOBAL_WILDCARD);

        let mut awaited = Vec::with_capacity(exact.len());
        for handler in exact {
            awaited.push(tokio::spawn(handler(payload.clone(), metadata.clone())));
        }
        for handler in category.into_iter().chain(global) {
            tokio::spawn(handler(payload.clone(), metadata.clone()));
        }
        for task in awaited {
            if task.await.is_err() {
                warn!(event_type = %event_type, "event handler panicked");
            }
        }
    }

    /// Resolves with the next event of the given type, or fails with
    /// [`BusError::WaitTimeout`] once `timeout` elapses. The internal
    /// subscription is removed on both paths.
    pub async fn wait_for(
        &self,
        event_type: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<BusEvent, BusError> {
        let event_type = event_type.into();
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let subscription = self.once(event_type.clone(), {
            let slot = Arc::clone(&slot);
            handler(move |payload, metadata| {
                let slot = Arc::clone(&slot);
                async move {
                    if let Some(tx) = slot.lock().take() {
                        let _ = tx.send(BusEvent {
                            event_type: metadata.event_type.clone(),
                            payload,
                            metadata,
                        });
                    }
                }
            })
        });

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(Ok(event)) => Ok(event),
                Ok(Err(_)) => {
                    subscription.unsubscribe();
                    Err(BusError::BusGone { event_type })
                }
                Err(_) => {
                    subscription.unsubscribe();
                    Err(BusError::WaitTimeout {
                        event_type,
                        timeout_ms: limit.as_millis() as u64,
                    })
                }
            },
            None => match rx.await {
                Ok(event) => Ok(event),
                Err(_) => {
                    subscription.unsubscribe();
                    Err(BusError::BusGone { event_type })
                }
            },
        }
    }

    /// Tags all subsequently published events until cleared.
    pub fn set_correlation_id(&self, id: Option<String>) {
        *self.correlation.write() = id;
    }

    pub fn correlation_id(&self) -> Option<String> {
        self.correlation.read().clone()
    }

    /// Most recent events in publish order, optionally capped to `limit`.
    pub fn history(&self, limit: Option<usize>) -> Vec<BusEvent> {
        let events = self.events.lock().snapshot();
        match limit {
            Some(limit) if limit < events.len() => events[events.len() - limit..].to_vec(),
            _ => events,
        }
    }

    pub fn history_by_type(&self, event_type: &str) -> Vec<BusEvent> {
        self.events
            .lock()
            .snapshot()
            .into_iter()
            .filter(|event| event.event_type == event_type)
            .collect()
    }

    pub fn clear_history(&self) {
        self.events.lock().clear();
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers
            .get(key)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    fn register(&self, key: String, handler: EventHandler, once: bool) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(key.clone())
            .or_default()
            .push(Subscriber { id, handler, once });
        Subscription {
            key,
            id,
            table: Arc::downgrade(&self.subscribers),
        }
    }

    /// Collects the handlers registered under `key`; `once` registrations are
    /// consumed by the collection so only a single publish ever sees them.
    fn drain_tier(&self, key: &str) -> Vec<EventHandler> {
        match self.subscribers.get_mut(key) {
            Some(mut entry) => {
                let handlers = entry.iter().map(|sub| Arc::clone(&sub.handler)).collect();
                entry.retain(|sub| !sub.once);
                handlers
            }
            None => Vec::new(),
        }
    }
}

fn category_key(event_type: &str) -> Option<String> {
    event_type
        .split_once(':')
        .map(|(category, _)| format!("{category}:*"))
}
