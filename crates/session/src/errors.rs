use thiserror::Error;

use crate::entity::SessionStatus;

#[derive(Debug, Error, Clone)]
pub enum SessionError {
    #[error("session cannot accept a message while {current}")]
    NotAccepting { current: SessionStatus },
    #[error("invalid transition to {target} while {current}")]
    InvalidTransition {
        current: SessionStatus,
        target: SessionStatus,
    },
    #[error("no question handler configured")]
    NoHandler,
    #[error("question handler failed: {message}")]
    Handler { message: String },
    #[error("session actor mailbox closed")]
    MailboxClosed,
    #[error("invalid session snapshot: {0}")]
    Snapshot(String),
}
