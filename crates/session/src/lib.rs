mod actor;
mod entity;
mod errors;

pub use actor::{ActorInfo, QuestionHandler, SessionActor};
pub use entity::{Message, Role, SessionConfig, SessionEntity, SessionInfo, SessionStatus};
pub use errors::SessionError;
