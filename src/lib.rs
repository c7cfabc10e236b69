//! Concurrency and lifecycle kernel for shared notebook browser-automation
//! sessions.
//!
//! Many logical conversations are multiplexed onto a small number of
//! expensive browser resources. The kernel guarantees that each
//! conversation's requests execute strictly in order, that the shared
//! resource is reference-counted and never torn down while in use (outside
//! forced shutdown), and that components communicate through a typed event
//! bus instead of direct coupling. Transport, persistence and the concrete
//! automation driver are collaborators injected at the seams
//! ([`session::QuestionHandler`], [`pool::ContextProvider`]).

pub mod config;
pub mod errors;
pub mod manager;

pub use config::ManagerConfig;
pub use errors::Error;
pub use manager::SessionManager;

pub use notepilot_auth_center as auth;
pub use notepilot_context_pool as pool;
pub use notepilot_core_types as core_types;
pub use notepilot_event_bus as bus;
pub use notepilot_session as session;
