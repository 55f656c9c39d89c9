//! Which client ids currently have a live employee session.
//!
//! The same machine may briefly hold two connections (a reconnect racing the
//! old socket's teardown), so ids are reference counted: the client is
//! online until its last session leaves.

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct OnlineRegistry {
    sessions: Mutex<HashMap<i64, usize>>,
}

impl OnlineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: i64) {
        *self.sessions.lock().entry(id).or_insert(0) += 1;
    }

    /// Drops one session of `id`.  Returns `true` if that was the last one.
    pub fn remove(&self, id: i64) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                sessions.remove(&id);
                true
            }
            None => false,
        }
    }

    pub fn is_online(&self, id: i64) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_starts_empty() {
        let registry = OnlineRegistry::new();
        assert!(registry.is_empty());
        assert!(!registry.is_online(1));
    }

    #[test]
    fn test_add_then_remove_goes_offline() {
        let registry = OnlineRegistry::new();
        registry.add(7);
        assert!(registry.is_online(7));
        assert!(registry.remove(7));
        assert!(!registry.is_online(7));
    }

    #[test]
    fn test_second_session_keeps_client_online() {
        // Arrange
        let registry = OnlineRegistry::new();
        registry.add(7);
        registry.add(7);

        // Act
        let last = registry.remove(7);

        // Assert
        assert!(!last);
        assert!(registry.is_online(7));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_unknown_id_is_noop() {
        let registry = OnlineRegistry::new();
        assert!(!registry.remove(99));
    }
}
