use thiserror::Error;

use notepilot_core_types::{PilotError, SessionId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error(transparent)]
    Session(#[from] notepilot_session::SessionError),
    #[error(transparent)]
    Pool(#[from] notepilot_context_pool::PoolError),
    #[error(transparent)]
    Bus(#[from] notepilot_event_bus::BusError),
    #[error(transparent)]
    Core(#[from] PilotError),
}
