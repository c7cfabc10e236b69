use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use notepilot_core_types::{PilotError, SessionId};
use notepilot_event_bus::EventBus;

use crate::entity::{SessionConfig, SessionEntity, SessionInfo};
use crate::errors::SessionError;

/// Injected automation collaborator that answers one question against the
/// session's notebook. Receives an immutable snapshot; must not retain it.
#[async_trait]
pub trait QuestionHandler: Send + Sync {
    async fn handle(&self, session: &SessionEntity, question: &str)
        -> Result<String, PilotError>;
}

enum Request {
    Ask {
        question: String,
        reply: oneshot::Sender<Result<String, SessionError>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Touch,
}

impl Request {
    fn kind(&self) -> &'static str {
        match self {
            Request::Ask { .. } => "ask",
            Request::Reset { .. } => "reset",
            Request::Close { .. } => "close",
            Request::Touch => "touch",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ActorInfo {
    #[serde(flatten)]
    pub session: SessionInfo,
    pub queue_length: usize,
    pub is_active: bool,
}

/// Single writer of one [`SessionEntity`]. A dedicated worker task drains the
/// mailbox, so no two requests for the same session are ever processed
/// concurrently. Requests are enqueued synchronously by the public methods
/// before any await, which makes call order the processing order even when
/// callers never await between submissions.
pub struct SessionActor {
    id: SessionId,
    entity: Arc<RwLock<SessionEntity>>,
    handler: Arc<RwLock<Option<Arc<dyn QuestionHandler>>>>,
    tx: mpsc::UnboundedSender<Request>,
    pending: Arc<AtomicUsize>,
    active: Arc<AtomicBool>,
    bus: Option<Arc<EventBus>>,
}

impl SessionActor {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Self::build(config, None, None)
    }

    pub fn with_bus(config: SessionConfig, bus: Arc<EventBus>) -> Arc<Self> {
        Self::build(config, None, Some(bus))
    }

    pub fn build(
        config: SessionConfig,
        handler: Option<Arc<dyn QuestionHandler>>,
        bus: Option<Arc<EventBus>>,
    ) -> Arc<Self> {
        let entity = SessionEntity::new(config);
        let id = entity.id.clone();
        let entity = Arc::new(RwLock::new(entity));
        let handler = Arc::new(RwLock::new(handler));
        let pending = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = Worker {
            id: id.clone(),
            entity: Arc::clone(&entity),
            handler: Arc::clone(&handler),
            pending: Arc::clone(&pending),
            active: Arc::clone(&active),
            bus: bus.clone(),
        };
        tokio::spawn(worker.run(rx));

        Arc::new(Self {
            id,
            entity,
            handler,
            tx,
            pending,
            active,
            bus,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn set_question_handler(&self, handler: Arc<dyn QuestionHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Queues the question and resolves with the automation answer. Fails
    /// without touching the entity when no handler is configured or the
    /// session is not idle.
    pub fn ask(
        &self,
        question: impl Into<String>,
    ) -> impl Future<Output = Result<String, SessionError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let queued = self.enqueue(Request::Ask {
            question: question.into(),
            reply,
        });
        async move {
            queued?;
            rx.await.map_err(|_| SessionError::MailboxClosed)?
        }
    }

    pub fn reset(&self) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let queued = self.enqueue(Request::Reset { reply });
        async move {
            queued?;
            rx.await.map_err(|_| SessionError::MailboxClosed)
        }
    }

    /// Closes the session and marks the actor inactive. Later `ask` calls are
    /// not rejected up front; they fail through the status guard naming
    /// `closed`.
    pub fn close(&self) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let queued = self.enqueue(Request::Close { reply });
        async move {
            queued?;
            rx.await.map_err(|_| SessionError::MailboxClosed)
        }
    }

    /// Fire-and-forget activity refresh; still ordered through the mailbox.
    pub fn touch(&self) {
        let _ = self.enqueue(Request::Touch);
    }

    /// Immutable snapshot of the current entity.
    pub fn state(&self) -> SessionEntity {
        self.entity.read().clone()
    }

    /// Requests enqueued or in flight right now.
    pub fn pending_messages(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> ActorInfo {
        ActorInfo {
            session: self.entity.read().to_info(),
            queue_length: self.pending_messages(),
            is_active: self.is_active(),
        }
    }

    fn enqueue(&self, request: Request) -> Result<(), SessionError> {
        let kind = request.kind();
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(request).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(SessionError::MailboxClosed);
        }
        if let Some(bus) = &self.bus {
            let bus = Arc::clone(bus);
            let session_id = self.id.0.clone();
            tokio::spawn(async move {
                bus.publish(
                    "session:message_queued",
                    json!({ "session_id": session_id, "kind": kind }),
                )
                .await;
            });
        }
        Ok(())
    }
}

struct Worker {
    id: SessionId,
    entity: Arc<RwLock<SessionEntity>>,
    handler: Arc<RwLock<Option<Arc<dyn QuestionHandler>>>>,
    pending: Arc<AtomicUsize>,
    active: Arc<AtomicBool>,
    bus: Option<Arc<EventBus>>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Request>) {
        while let Some(request) = rx.recv().await {
            let kind = request.kind();
            let started = Instant::now();
            match request {
                Request::Ask { question, reply } => {
                    let result = self.process_ask(&question).await;
                    self.finish(kind, started).await;
                    let _ = reply.send(result);
                }
                Request::Reset { reply } => {
                    let next = self.entity.read().reset();
                    self.swap(next).await;
                    self.finish(kind, started).await;
                    let _ = reply.send(());
                }
                Request::Close { reply } => {
                    let next = self.entity.read().close();
                    self.swap(next).await;
                    self.active.store(false, Ordering::SeqCst);
                    self.publish("session:closed", json!({ "session_id": self.id.0 }))
                        .await;
                    self.finish(kind, started).await;
                    let _ = reply.send(());
                }
                Request::Touch => {
                    let next = self.entity.read().touch();
                    self.swap(next).await;
                    self.finish(kind, started).await;
                }
            }
        }
        debug!(session = %self.id, "session actor mailbox drained");
    }

    async fn process_ask(&self, question: &str) -> Result<String, SessionError> {
        let handler = self
            .handler
            .read()
            .clone()
            .ok_or(SessionError::NoHandler)?;

        let current = self.entity.read().clone();
        let processing = current.start_processing(question)?;
        self.swap(processing.clone()).await;
        self.publish(
            "session:user_message",
            json!({ "session_id": self.id.0, "content": question }),
        )
        .await;

        let waiting = processing.start_waiting()?;
        self.swap(waiting.clone()).await;

        match handler.handle(&waiting, question).await {
            Ok(answer) => {
                let completed = waiting.complete_with_response(&answer)?;
                self.swap(completed).await;
                self.publish(
                    "session:assistant_message",
                    json!({ "session_id": self.id.0, "content": answer }),
                )
                .await;
                Ok(answer)
            }
            Err(err) => {
                let message = err.to_string();
                let errored = waiting.mark_error(&message);
                self.swap(errored).await;
                self.publish(
                    "session:error",
                    json!({ "session_id": self.id.0, "error": message }),
                )
                .await;
                Err(SessionError::Handler { message })
            }
        }
    }

    /// The entity reference is only ever replaced here, on the worker task.
    async fn swap(&self, next: SessionEntity) {
        let previous = {
            let mut guard = self.entity.write();
            std::mem::replace(&mut *guard, next.clone())
        };
        self.publish(
            "session:state_changed",
            json!({
                "session_id": self.id.0,
                "status": next.status,
                "previous_status": previous.status,
            }),
        )
        .await;
    }

    async fn finish(&self, kind: &'static str, started: Instant) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.publish(
            "session:message_processed",
            json!({
                "session_id": self.id.0,
                "kind": kind,
                "duration_ms": started.elapsed().as_millis() as u64,
            }),
        )
        .await;
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

    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::time::{sleep, timeout};

    use crate::entity::SessionStatus;

    struct RecordingHandler {
        invoked: Arc<Mutex<Vec<String>>>,
        delays_ms: Vec<u64>,
        calls: AtomicUsize,
    }

    impl RecordingHandler {
        fn new(delays_ms: Vec<u64>) -> Arc<Self> {
            Arc::new(Self {
                invoked: Arc::new(Mutex::new(Vec::new())),
                delays_ms,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl QuestionHandler for RecordingHandler {
        async fn handle(
            &self,
            _session: &SessionEntity,
            question: &str,
        ) -> Result<String, PilotError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.invoked.lock().push(question.to_string());
            let delay = self.delays_ms.get(call).copied().unwrap_or(1);
            sleep(Duration::from_millis(delay)).await;
            Ok(format!("echo:{question}"))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl QuestionHandler for FailingHandler {
        async fn handle(
            &self,
            _session: &SessionEntity,
            _question: &str,
        ) -> Result<String, PilotError> {
            Err(PilotError::new("automation driver crashed"))
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::new("https://notebook.example/abc")
    }

    #[tokio::test]
    async fn concurrent_asks_are_processed_in_submission_order() {
        let handler = RecordingHandler::new(vec![40, 15, 1]);
        let actor = SessionActor::build(config(), Some(handler.clone()), None);

        let f1 = actor.ask("1");
        let f2 = actor.ask("2");
        let f3 = actor.ask("3");
        let (r1, r2, r3) = tokio::join!(f1, f2, f3);

        assert_eq!(r1.unwrap(), "echo:1");
        assert_eq!(r2.unwrap(), "echo:2");
        assert_eq!(r3.unwrap(), "echo:3");
        assert_eq!(*handler.invoked.lock(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn pending_counter_tracks_queue_depth() {
        let handler = RecordingHandler::new(vec![20, 20, 20]);
        let actor = SessionActor::build(config(), Some(handler), None);

        let f1 = actor.ask("a");
        let f2 = actor.ask("b");
        let f3 = actor.ask("c");
        assert_eq!(actor.pending_messages(), 3);

        let _ = tokio::join!(f1, f2, f3);
        assert_eq!(actor.pending_messages(), 0);
    }

    #[tokio::test]
    async fn ask_without_handler_fails_and_recovers() {
        let actor = SessionActor::new(config());

        let err = actor.ask("hello").await.unwrap_err();
        assert!(matches!(err, SessionError::NoHandler));
        assert_eq!(actor.state().status, SessionStatus::Idle);

        actor.set_question_handler(RecordingHandler::new(vec![1]));
        assert_eq!(actor.ask("hello").await.unwrap(), "echo:hello");
    }

    #[tokio::test]
    async fn handler_failure_marks_error_and_propagates() {
        let actor = SessionActor::build(config(), Some(Arc::new(FailingHandler)), None);

        let err = actor.ask("q").await.unwrap_err();
        match &err {
            SessionError::Handler { message } => {
                assert!(message.contains("automation driver crashed"))
            }
            other => panic!("unexpected error {other:?}"),
        }

        let state = actor.state();
        assert_eq!(state.status, SessionStatus::Error);
        assert_eq!(
            state.error_message.as_deref(),
            Some("automation driver crashed")
        );

        // Not a fatal actor error: reset and continue with a working handler.
        actor.reset().await.unwrap();
        actor.set_question_handler(RecordingHandler::new(vec![1]));
        assert_eq!(actor.ask("again").await.unwrap(), "echo:again");
    }

    #[tokio::test]
    async fn close_marks_inactive_and_later_asks_fail_on_status() {
        let actor = SessionActor::build(config(), Some(RecordingHandler::new(vec![1])), None);
        actor.ask("q").await.unwrap();

        actor.close().await.unwrap();
        assert!(!actor.is_active());
        let state = actor.state();
        assert_eq!(state.status, SessionStatus::Closed);
        assert_eq!(state.messages.len(), 2);

        let err = actor.ask("late").await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn touch_refreshes_activity_through_the_mailbox() {
        let actor = SessionActor::new(config());
        let before = actor.state().last_activity_at;

        sleep(Duration::from_millis(20)).await;
        actor.touch();
        sleep(Duration::from_millis(20)).await;

        assert!(actor.state().last_activity_at > before);
        assert_eq!(actor.pending_messages(), 0);
    }

    #[tokio::test]
    async fn publishes_lifecycle_events() {
        let bus = EventBus::new();
        let actor = SessionActor::build(
            config(),
            Some(RecordingHandler::new(vec![1])),
            Some(Arc::clone(&bus)),
        );

        actor.ask("q").await.unwrap();
        sleep(Duration::from_millis(20)).await;

        for event_type in [
            "session:message_queued",
            "session:user_message",
            "session:assistant_message",
            "session:message_processed",
        ] {
            assert_eq!(
                bus.history_by_type(event_type).len(),
                1,
                "missing {event_type}"
            );
        }
        // idle -> processing -> waiting -> idle
        assert_eq!(bus.history_by_type("session:state_changed").len(), 3);
    }

    #[tokio::test]
    async fn stuck_handler_stalls_only_its_own_queue() {
        let slow = SessionActor::build(config(), Some(RecordingHandler::new(vec![200])), None);
        let fast = SessionActor::build(config(), Some(RecordingHandler::new(vec![1])), None);

        let stalled = slow.ask("slow");
        let quick = fast.ask("fast");

        let answer = timeout(Duration::from_millis(100), quick)
            .await
            .expect("unrelated actor must not stall");
        assert_eq!(answer.unwrap(), "echo:fast");
        assert_eq!(slow.pending_messages(), 1);

        assert_eq!(stalled.await.unwrap(), "echo:slow");
    }

    #[tokio::test]
    async fn info_reports_queue_and_activity() {
        let actor = SessionActor::build(config(), Some(RecordingHandler::new(vec![1])), None);
        actor.ask("q").await.unwrap();

        let info = actor.info();
        assert_eq!(info.session.message_count, 2);
        assert_eq!(info.queue_length, 0);
        assert!(info.is_active);
    }
}
