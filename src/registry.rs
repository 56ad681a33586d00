//! Process-wide session registry: live-session counter and ID generator.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

/// Shared between all connection tasks. The live counter drives admission
/// control; IDs are unique within a process run.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    live: Mutex<i64>,
    next_id: Mutex<u64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the live counter and returns the new value.
    pub fn add_session(&self) -> i64 {
        let mut live = lock(&self.live);
        *live += 1;
        *live
    }

    /// Decrements the live counter, clamped so it never goes negative.
    pub fn remove_session(&self) -> i64 {
        let mut live = lock(&self.live);
        *live -= 1;
        if *live < 0 {
            *live = 0;
        }
        *live
    }

    pub fn live_sessions(&self) -> i64 {
        *lock(&self.live)
    }

    /// Generates a session ID from a time component plus a monotonic
    /// counter; the counter wraps only at its numeric ceiling.
    pub fn session_id(&self) -> String {
        let mut next = lock(&self.next_id);
        if *next == u64::MAX {
            *next = 0;
        }
        *next += 1;
        format!("{:X}{:X}", Utc::now().timestamp_micros(), *next)
    }

    /// Admits a new session: bumps the live counter and issues an ID.
    /// The returned guard releases the slot exactly once when dropped.
    pub fn admit(self: &Arc<Self>) -> Admission {
        Admission {
            registry: Arc::clone(self),
            ordinal: self.add_session(),
            id: self.session_id(),
        }
    }
}

/// Guard for one admitted session.
#[derive(Debug)]
pub struct Admission {
    registry: Arc<SessionRegistry>,
    pub ordinal: i64,
    pub id: String,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.registry.remove_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_ordinal_sequence() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.add_session(), 1);
        assert_eq!(registry.add_session(), 2);
        assert_eq!(registry.remove_session(), 1);
        assert_eq!(registry.remove_session(), 0);
    }

    #[test]
    fn test_counter_never_negative() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.remove_session(), 0);
        assert_eq!(registry.remove_session(), 0);
        assert_eq!(registry.add_session(), 1);
    }

    #[test]
    fn test_admission_releases_on_drop() {
        let registry = Arc::new(SessionRegistry::new());
        {
            let admission = registry.admit();
            assert_eq!(admission.ordinal, 1);
            assert_eq!(registry.live_sessions(), 1);
        }
        assert_eq!(registry.live_sessions(), 0);
    }

    #[test]
    fn test_concurrent_admissions() {
        let registry = Arc::new(SessionRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let _admission = registry.admit();
                    assert!(registry.live_sessions() >= 0);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.live_sessions(), 0);
    }

    #[test]
    fn test_unique_ids_under_concurrency() {
        let registry = Arc::new(SessionRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                (0..200).map(|_| registry.session_id()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate session ID issued");
            }
        }
    }
}
