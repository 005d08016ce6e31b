//! Bounded pool of inbound connection slots

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{Result, TapedeckError};

/// Limits how many inbound connections are served at once
#[derive(Clone)]
pub struct ConnectionPool {
    semaphore: Arc<Semaphore>,
    max_connections: usize,
}

impl ConnectionPool {
    /// Create a pool with `max_connections` slots
    ///
    /// # Errors
    ///
    /// Returns error if `max_connections` is 0
    pub fn new(max_connections: usize) -> Result<Self> {
        if max_connections == 0 {
            return Err(TapedeckError::Config(
                "max_connections must be > 0".to_string(),
            ));
        }

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Take a slot if one is free
    #[must_use]
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| ConnectionGuard { _permit: permit })
    }

    /// Connections currently holding a slot
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.max_connections - self.semaphore.available_permits()
    }

    /// Configured slot count
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Slot held for the life of one connection
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
}
