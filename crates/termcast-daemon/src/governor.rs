//! Ceilings on concurrent sessions and viewer connections.
//!
//! Each admitted request holds a permit; the count goes back down when the
//! permit is dropped, so every teardown path releases exactly once.

use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::GovernorError;
use crate::error::Resource;

#[derive(Debug)]
pub struct SessionPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
struct Ceiling {
    resource: Resource,
    limit: usize,
    semaphore: Arc<Semaphore>,
}

impl Ceiling {
    fn new(resource: Resource, limit: usize) -> Self {
        Self {
            resource,
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    fn try_acquire(&self) -> Result<OwnedSemaphorePermit, GovernorError> {
        self.semaphore.clone().try_acquire_owned().map_err(|_| {
            warn!(
                resource = self.resource.as_str(),
                limit = self.limit,
                "Rejecting request: limit reached"
            );
            GovernorError::LimitReached {
                resource: self.resource,
                limit: self.limit,
            }
        })
    }

    fn active(&self) -> usize {
        self.limit.saturating_sub(self.semaphore.available_permits())
    }
}

/// Admission control shared by the session manager and the WebSocket server.
#[derive(Debug)]
pub struct ResourceGovernor {
    sessions: Ceiling,
    connections: Ceiling,
}

impl ResourceGovernor {
    pub fn new(max_sessions: usize, max_connections: usize) -> Self {
        Self {
            sessions: Ceiling::new(Resource::Sessions, max_sessions),
            connections: Ceiling::new(Resource::Connections, max_connections),
        }
    }

    /// Admits one session or rejects immediately; never waits.
    pub fn acquire_session(&self) -> Result<SessionPermit, GovernorError> {
        self.sessions
            .try_acquire()
            .map(|permit| SessionPermit { _permit: permit })
    }

    pub fn acquire_connection(&self) -> Result<ConnectionPermit, GovernorError> {
        self.connections
            .try_acquire()
            .map(|permit| ConnectionPermit { _permit: permit })
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.active()
    }

    pub fn active_connections(&self) -> usize {
        self.connections.active()
    }

    pub fn max_sessions(&self) -> usize {
        self.sessions.limit
    }

    pub fn max_connections(&self) -> usize {
        self.connections.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ceiling() {
        let governor = ResourceGovernor::new(2, 1);
        let a = governor.acquire_session().unwrap();
        let _b = governor.acquire_session().unwrap();
        assert_eq!(governor.active_sessions(), 2);

        let err = governor.acquire_session().unwrap_err();
        assert_eq!(
            err,
            GovernorError::LimitReached {
                resource: Resource::Sessions,
                limit: 2
            }
        );

        drop(a);
        assert_eq!(governor.active_sessions(), 1);
        assert!(governor.acquire_session().is_ok());
    }

    #[test]
    fn test_ceilings_are_independent() {
        let governor = ResourceGovernor::new(1, 1);
        let _s = governor.acquire_session().unwrap();
        let c = governor.acquire_connection().unwrap();
        assert!(matches!(
            governor.acquire_connection(),
            Err(GovernorError::LimitReached {
                resource: Resource::Connections,
                ..
            })
        ));
        drop(c);
        assert_eq!(governor.active_connections(), 0);
        assert_eq!(governor.active_sessions(), 1);
    }

    #[test]
    fn test_zero_limit_rejects_everything() {
        let governor = ResourceGovernor::new(0, 0);
        assert!(governor.acquire_session().is_err());
        assert!(governor.acquire_connection().is_err());
        assert_eq!(governor.active_sessions(), 0);
    }

    #[test]
    fn test_permit_released_once_across_threads() {
        let governor = Arc::new(ResourceGovernor::new(4, 4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let governor = Arc::clone(&governor);
                std::thread::spawn(move || {
                    let permit = governor.acquire_session().unwrap();
                    drop(permit);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(governor.active_sessions(), 0);
    }
}
