//! Session arbitration
//!
//! Motion commands require a session so that two operators cannot fight
//! over the chassis unknowingly. An exclusive session locks motion to
//! its holder; shared sessions cooperate. Sessions idle past the
//! configured timeout are expired lazily on the next registry access.
//! Emergency stop is deliberately outside this mechanism.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Opaque session handle handed to API clients
pub type SessionId = u64;

/// Access mode requested at acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Shared,
    Exclusive,
}

/// Live session counts for the status endpoint
#[derive(Debug, Clone, Copy)]
pub struct SessionCounts {
    pub live: usize,
    pub exclusive_held: bool,
}

struct SessionEntry {
    kind: SessionKind,
    last_active: Instant,
}

struct RegistryState {
    sessions: HashMap<SessionId, SessionEntry>,
    next_id: SessionId,
}

/// Registry of live control sessions
pub struct SessionRegistry {
    idle_timeout: Duration,
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        SessionRegistry {
            idle_timeout,
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Create a session, enforcing at most one exclusive holder
    pub fn acquire(&self, kind: SessionKind) -> Result<SessionId> {
        let mut state = self.state.lock();
        Self::prune(&mut state, self.idle_timeout);
        if kind == SessionKind::Exclusive
            && state.sessions.values().any(|s| s.kind == SessionKind::Exclusive)
        {
            return Err(Error::SessionBusy);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.sessions.insert(
            id,
            SessionEntry {
                kind,
                last_active: Instant::now(),
            },
        );
        log::info!("Session {} acquired ({:?})", id, kind);
        Ok(id)
    }

    /// Drop a session explicitly
    pub fn release(&self, id: SessionId) -> Result<()> {
        let mut state = self.state.lock();
        Self::prune(&mut state, self.idle_timeout);
        if state.sessions.remove(&id).is_none() {
            return Err(Error::SessionExpired);
        }
        log::info!("Session {} released", id);
        Ok(())
    }

    /// Check that `id` may drive the chassis right now, and mark it active
    ///
    /// Fails when the session is gone or when a different session holds
    /// exclusive control.
    pub fn authorize_motion(&self, id: SessionId) -> Result<()> {
        let mut state = self.state.lock();
        Self::prune(&mut state, self.idle_timeout);
        if !state.sessions.contains_key(&id) {
            return Err(Error::SessionExpired);
        }
        let blocked = state
            .sessions
            .iter()
            .any(|(other, s)| *other != id && s.kind == SessionKind::Exclusive);
        if blocked {
            return Err(Error::SessionBusy);
        }
        if let Some(entry) = state.sessions.get_mut(&id) {
            entry.last_active = Instant::now();
        }
        Ok(())
    }

    pub fn counts(&self) -> SessionCounts {
        let mut state = self.state.lock();
        Self::prune(&mut state, self.idle_timeout);
        SessionCounts {
            live: state.sessions.len(),
            exclusive_held: state
                .sessions
                .values()
                .any(|s| s.kind == SessionKind::Exclusive),
        }
    }

    fn prune(state: &mut RegistryState, idle_timeout: Duration) {
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, s| s.last_active.elapsed() <= idle_timeout);
        let expired = before - state.sessions.len();
        if expired > 0 {
            log::debug!("Expired {} idle session(s)", expired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const IDLE: Duration = Duration::from_millis(150);

    #[test]
    fn test_single_exclusive_holder() {
        let reg = SessionRegistry::new(IDLE);
        let first = reg.acquire(SessionKind::Exclusive).unwrap();
        assert!(matches!(
            reg.acquire(SessionKind::Exclusive).unwrap_err(),
            Error::SessionBusy
        ));
        // Shared observers can still join
        assert!(reg.acquire(SessionKind::Shared).is_ok());
        reg.release(first).unwrap();
        assert!(reg.acquire(SessionKind::Exclusive).is_ok());
    }

    #[test]
    fn test_exclusive_blocks_other_motion() {
        let reg = SessionRegistry::new(IDLE);
        let shared = reg.acquire(SessionKind::Shared).unwrap();
        let excl = reg.acquire(SessionKind::Exclusive).unwrap();

        assert!(matches!(
            reg.authorize_motion(shared).unwrap_err(),
            Error::SessionBusy
        ));
        assert!(reg.authorize_motion(excl).is_ok());

        reg.release(excl).unwrap();
        assert!(reg.authorize_motion(shared).is_ok());
    }

    #[test]
    fn test_idle_expiry() {
        let reg = SessionRegistry::new(IDLE);
        let id = reg.acquire(SessionKind::Shared).unwrap();
        thread::sleep(IDLE + Duration::from_millis(30));
        assert!(matches!(
            reg.authorize_motion(id).unwrap_err(),
            Error::SessionExpired
        ));
        assert_eq!(reg.counts().live, 0);
    }

    #[test]
    fn test_activity_extends_session() {
        let reg = SessionRegistry::new(IDLE);
        let id = reg.acquire(SessionKind::Shared).unwrap();
        thread::sleep(Duration::from_millis(90));
        assert!(reg.authorize_motion(id).is_ok());
        thread::sleep(Duration::from_millis(90));
        // 180ms since acquire but only 90ms since last activity
        assert!(reg.authorize_motion(id).is_ok());
    }

    #[test]
    fn test_expired_exclusive_frees_the_rover() {
        let reg = SessionRegistry::new(IDLE);
        let _excl = reg.acquire(SessionKind::Exclusive).unwrap();
        thread::sleep(IDLE + Duration::from_millis(30));
        let next = reg.acquire(SessionKind::Exclusive).unwrap();
        assert!(reg.authorize_motion(next).is_ok());
    }

    #[test]
    fn test_release_unknown_session() {
        let reg = SessionRegistry::new(IDLE);
        assert!(matches!(
            reg.release(42).unwrap_err(),
            Error::SessionExpired
        ));
    }

    #[test]
    fn test_counts() {
        let reg = SessionRegistry::new(IDLE);
        assert_eq!(reg.counts().live, 0);
        assert!(!reg.counts().exclusive_held);

        let _a = reg.acquire(SessionKind::Shared).unwrap();
        let _b = reg.acquire(SessionKind::Exclusive).unwrap();
        let counts = reg.counts();
        assert_eq!(counts.live, 2);
        assert!(counts.exclusive_held);
    }
}
