use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use notepilot_core_types::{PilotError, SessionId};
use notepilot_event_bus::EventBus;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("context factory failed for {mode} mode: {message}")]
    Factory { mode: ContextMode, message: String },
}

/// Visibility mode the shared context is launched with. Changing it requires
/// tearing the context down and recreating it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    Headless,
    Headful,
}

impl ContextMode {
    pub fn from_headless(headless: bool) -> Self {
        if headless {
            ContextMode::Headless
        } else {
            ContextMode::Headful
        }
    }

    pub fn is_headless(self) -> bool {
        self == ContextMode::Headless
    }
}

impl fmt::Display for ContextMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ContextMode::Headless => "headless",
            ContextMode::Headful => "headful",
        };
        f.write_str(label)
    }
}

/// Injected automation adapter that actually launches and tears down the
/// expensive shared context. The handle must be cheap to clone.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    type Context: Clone + Send + Sync + 'static;

    async fn create(
        &self,
        mode: ContextMode,
        init: Option<serde_json::Value>,
    ) -> Result<Self::Context, PilotError>;

    async fn close(&self, context: Self::Context) -> Result<(), PilotError>;
}

struct PooledContext<C> {
    context: C,
    ref_count: usize,
    created_at: Instant,
    last_access: Instant,
    mode: ContextMode,
    holders: HashSet<SessionId>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ContextStats {
    pub ref_count: usize,
    pub holders: Vec<String>,
    pub age_seconds: u64,
    pub mode: ContextMode,
}

#[derive(Clone, Debug, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub total_refs: usize,
    pub entries: Vec<ContextStats>,
}

/// Multiplexes many logical sessions onto one expensive shared context.
/// Checkouts are reference-counted; the context is recreated when the
/// requested mode differs from the pooled one and torn down only at forced
/// shutdown. `ref_count == holders.len()` always: re-acquiring from the same
/// session is a no-op bump.
pub struct ContextPool<P: ContextProvider> {
    provider: Arc<P>,
    slot: RwLock<Option<PooledContext<P::Context>>>,
    gate: Mutex<()>,
    bus: Option<Arc<EventBus>>,
}

impl<P: ContextProvider> ContextPool<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self::build(provider, None)
    }

    pub fn with_bus(provider: Arc<P>, bus: Arc<EventBus>) -> Self {
        Self::build(provider, Some(bus))
    }

    fn build(provider: Arc<P>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            provider,
            slot: RwLock::new(None),
            gate: Mutex::new(()),
            bus,
        }
    }

    /// Returns the shared context for `mode`, reusing the pooled one when the
    /// mode matches, recreating it when it differs. A factory failure
    /// propagates and leaves the pool empty rather than half-initialized.
    ///
    /// Reconfiguration while holders remain attached is warned about but not
    /// blocked; those holders keep a handle to a context that has been closed
    /// under them.
    pub async fn acquire(
        &self,
        session: &SessionId,
        mode: ContextMode,
        init: Option<serde_json::Value>,
    ) -> Result<P::Context, PoolError> {
        let _guard = self.gate.lock().await;

        {
            let mut slot = self.slot.write();
            if let Some(entry) = slot.as_mut() {
                if entry.mode == mode {
                    if entry.holders.insert(session.clone()) {
                        entry.ref_count += 1;
                    }
                    entry.last_access = Instant::now();
                    debug!(session = %session, mode = %mode, refs = entry.ref_count, "reusing shared context");
                    return Ok(entry.context.clone());
                }
            }
        }

        let stale = self.slot.write().take();
        if let Some(PooledContext {
            context,
            ref_count,
            mode: old_mode,
            ..
        }) = stale
        {
            if ref_count > 0 {
                warn!(
                    holders = ref_count,
                    from = %old_mode,
                    to = %mode,
                    "reconfiguring shared context while sessions are still attached"
                );
            }
            if let Err(err) = self.provider.close(context).await {
                warn!(error = %err, "failed to close stale context");
            }
            self.publish(
                "pool:context_reconfigured",
                json!({ "from": old_mode, "to": mode }),
            )
            .await;
        }

        let context = self
            .provider
            .create(mode, init)
            .await
            .map_err(|err| PoolError::Factory {
                mode,
                message: err.to_string(),
            })?;

        {
            let mut slot = self.slot.write();
            let mut entry = PooledContext {
                context: context.clone(),
                ref_count: 0,
                created_at: Instant::now(),
                last_access: Instant::now(),
                mode,
                holders: HashSet::new(),
            };
            entry.holders.insert(session.clone());
            entry.ref_count += 1;
            *slot = Some(entry);
        }
        self.publish(
            "pool:context_created",
            json!({ "mode": mode, "session_id": session.0 }),
        )
        .await;
        Ok(context)
    }

    /// Drops `session`'s hold. The context itself is retained for the next
    /// acquirer even at zero references.
    pub async fn release(&self, session: &SessionId) {
        let _guard = self.gate.lock().await;
        let mut slot = self.slot.write();
        match slot.as_mut() {
            Some(entry) if entry.holders.contains(session) => {
                entry.holders.remove(session);
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.last_access = Instant::now();
                debug!(session = %session, refs = entry.ref_count, "released shared context");
            }
            _ => warn!(session = %session, "release for a session that holds no context"),
        }
    }

    /// Shutdown path: closes the pooled context regardless of reference
    /// count. Closer failures are logged, not surfaced.
    pub async fn force_close(&self) {
        let _guard = self.gate.lock().await;
        let entry = self.slot.write().take();
        if let Some(PooledContext {
            context,
            ref_count,
            mode,
            ..
        }) = entry
        {
            if ref_count > 0 {
                warn!(holders = ref_count, "force-closing shared context while still referenced");
            }
            if let Err(err) = self.provider.close(context).await {
                warn!(error = %err, "context closer failed during shutdown");
            }
            self.publish("pool:context_closed", json!({ "mode": mode }))
                .await;
        }
    }

    /// Best-effort diagnostics snapshot; not serialized against
    /// acquire/release.
    pub fn stats(&self) -> PoolStats {
        let slot = self.slot.read();
        let entries: Vec<ContextStats> = slot
            .iter()
            .map(|entry| {
                let mut holders: Vec<String> =
                    entry.holders.iter().map(|id| id.0.clone()).collect();
                holders.sort();
                ContextStats {
                    ref_count: entry.ref_count,
                    holders,
                    age_seconds: entry.created_at.elapsed().as_secs(),
                    mode: entry.mode,
                }
            })
            .collect();
        PoolStats {
            size: entries.len(),
            total_refs: entries.iter().map(|entry| entry.ref_count).sum(),
            entries,
        }
    }

    async fn publish(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(event_type, payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex as SyncMutex;

    #[derive(Clone, Debug, Eq, PartialEq)]
    struct MockContext {
        id: usize,
        mode: ContextMode,
    }

    #[derive(Default)]
    struct MockProvider {
        created: AtomicUsize,
        closed: SyncMutex<Vec<MockContext>>,
        fail_create: AtomicBool,
    }

    #[async_trait]
    impl ContextProvider for MockProvider {
        type Context = MockContext;

        async fn create(
            &self,
            mode: ContextMode,
            _init: Option<serde_json::Value>,
        ) -> Result<MockContext, PilotError> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(PilotError::new("browser launch failed"));
            }
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(MockContext { id, mode })
        }

        async fn close(&self, context: MockContext) -> Result<(), PilotError> {
            self.closed.lock().push(context);
            Ok(())
        }
    }

    fn session(name: &str) -> SessionId {
        SessionId::from(name)
    }

    #[tokio::test]
    async fn same_mode_acquires_share_one_context() {
        let provider = Arc::new(MockProvider::default());
        let pool = ContextPool::new(Arc::clone(&provider));

        let c1 = pool
            .acquire(&session("s1"), ContextMode::Headless, None)
            .await
            .unwrap();
        let c2 = pool
            .acquire(&session("s2"), ContextMode::Headless, None)
            .await
            .unwrap();

        assert_eq!(c1, c2);
        assert_eq!(provider.created.load(Ordering::SeqCst), 1);

        let stats = pool.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.total_refs, 2);
        assert_eq!(stats.entries[0].holders, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn mode_change_swaps_the_context_despite_holders() {
        let provider = Arc::new(MockProvider::default());
        let pool = ContextPool::new(Arc::clone(&provider));

        let old = pool
            .acquire(&session("s1"), ContextMode::Headless, None)
            .await
            .unwrap();
        pool.acquire(&session("s2"), ContextMode::Headless, None)
            .await
            .unwrap();

        let fresh = pool
            .acquire(&session("s3"), ContextMode::Headful, None)
            .await
            .unwrap();

        assert_ne!(old.id, fresh.id);
        assert_eq!(fresh.mode, ContextMode::Headful);
        assert_eq!(*provider.closed.lock(), vec![old]);

        let stats = pool.stats();
        assert_eq!(stats.total_refs, 1);
        assert_eq!(stats.entries[0].mode, ContextMode::Headful);
    }

    #[tokio::test]
    async fn reacquire_by_same_session_does_not_inflate_refs() {
        let provider = Arc::new(MockProvider::default());
        let pool = ContextPool::new(provider);

        pool.acquire(&session("s1"), ContextMode::Headless, None)
            .await
            .unwrap();
        pool.acquire(&session("s1"), ContextMode::Headless, None)
            .await
            .unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total_refs, 1);
        assert_eq!(stats.entries[0].holders.len(), 1);
    }

    #[tokio::test]
    async fn release_keeps_the_context_warm() {
        let provider = Arc::new(MockProvider::default());
        let pool = ContextPool::new(Arc::clone(&provider));

        let first = pool
            .acquire(&session("s1"), ContextMode::Headless, None)
            .await
            .unwrap();
        pool.release(&session("s1")).await;
        assert_eq!(pool.stats().total_refs, 0);
        assert!(provider.closed.lock().is_empty());

        let second = pool
            .acquire(&session("s2"), ContextMode::Headless, None)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_of_unknown_session_is_harmless() {
        let provider = Arc::new(MockProvider::default());
        let pool = ContextPool::new(provider);

        pool.release(&session("ghost")).await;

        pool.acquire(&session("s1"), ContextMode::Headless, None)
            .await
            .unwrap();
        pool.release(&session("ghost")).await;
        assert_eq!(pool.stats().total_refs, 1);
    }

    #[tokio::test]
    async fn factory_failure_leaves_no_partial_entry() {
        let provider = Arc::new(MockProvider::default());
        let pool = ContextPool::new(Arc::clone(&provider));

        provider.fail_create.store(true, Ordering::SeqCst);
        let err = pool
            .acquire(&session("s1"), ContextMode::Headless, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("headless"));
        assert!(err.to_string().contains("browser launch failed"));
        assert_eq!(pool.stats().size, 0);

        provider.fail_create.store(false, Ordering::SeqCst);
        pool.acquire(&session("s1"), ContextMode::Headless, None)
            .await
            .unwrap();
        assert_eq!(pool.stats().total_refs, 1);
    }

    #[tokio::test]
    async fn force_close_tears_down_even_while_referenced() {
        let provider = Arc::new(MockProvider::default());
        let pool = ContextPool::new(Arc::clone(&provider));

        pool.acquire(&session("s1"), ContextMode::Headless, None)
            .await
            .unwrap();
        pool.force_close().await;

        assert_eq!(provider.closed.lock().len(), 1);
        assert_eq!(pool.stats().size, 0);
    }

    #[tokio::test]
    async fn publishes_pool_events() {
        let provider = Arc::new(MockProvider::default());
        let bus = EventBus::new();
        let pool = ContextPool::with_bus(provider, Arc::clone(&bus));

        pool.acquire(&session("s1"), ContextMode::Headless, None)
            .await
            .unwrap();
        pool.acquire(&session("s2"), ContextMode::Headful, None)
            .await
            .unwrap();

        assert_eq!(bus.history_by_type("pool:context_created").len(), 2);
        let swaps = bus.history_by_type("pool:context_reconfigured");
        assert_eq!(swaps.len(), 1);
        assert_eq!(swaps[0].payload["from"], "headless");
        assert_eq!(swaps[0].payload["to"], "headful");
    }
}
