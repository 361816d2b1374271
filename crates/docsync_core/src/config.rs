//! Database configuration.

use std::time::Duration;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// How long `close` waits for running replicators to stop.
    pub close_timeout: Duration,

    /// How many times `save_document_with_conflict_handler` consults the handler
    /// before giving up with a conflict error.
    pub max_conflict_handler_attempts: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(10),
            max_conflict_handler_attempts: 10,
        }
    }
}

impl DatabaseConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the close timeout.
    #[must_use]
    pub const fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Sets the conflict handler attempt limit (at least 1).
    #[must_use]
    pub const fn max_conflict_handler_attempts(mut self, attempts: u32) -> Self {
        self.max_conflict_handler_attempts = if attempts == 0 { 1 } else { attempts };
        self
    }
}
