use std::time::Duration;

use notepilot_session::SessionConfig;

/// Construction-time settings for [`crate::SessionManager`]. Everything is
/// passed in explicitly; components never read ambient process state.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Applied to sessions created without per-session overrides.
    pub defaults: SessionConfig,
    /// Inactivity window after which `reap_idle` considers a session dead.
    pub reap_after: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            defaults: SessionConfig::default(),
            reap_after: Duration::from_secs(30 * 60),
        }
    }
}

impl ManagerConfig {
    pub fn new(defaults: SessionConfig) -> Self {
        Self {
            defaults,
            ..Self::default()
        }
    }

    pub fn with_reap_after(mut self, reap_after: Duration) -> Self {
        self.reap_after = reap_after;
        self
    }
}
