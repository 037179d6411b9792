use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::connection::Connection;
use crate::core::envelope::Identity;
use crate::error::Result;

// Tracks every live session, keyed by session id. This is the only state
// mutated by more than one worker; all access goes through one mutex.
pub struct SessionRegistry {
    connections: HashMap<u64, Connection>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    // Register a freshly accepted connection
    pub fn add(&mut self, connection: Connection) {
        self.connections.insert(connection.id, connection);
    }

    // Remove a connection. Idempotent: removing an absent id is a no-op
    // and returns None, so concurrent teardown paths cannot double-fire.
    pub fn remove(&mut self, session_id: u64) -> Option<Connection> {
        self.connections.remove(&session_id)
    }

    pub fn get(&self, session_id: u64) -> Option<&Connection> {
        self.connections.get(&session_id)
    }

    /// Clone out the live sessions so the lock is never held across the
    /// fan-out writes of a broadcast pass
    pub fn snapshot(&self) -> Vec<Connection> {
        self.connections.values().cloned().collect()
    }

    /// Attach or update a session's identity.
    ///
    /// Returns `Some(true)` when the identity slot was empty (the attach
    /// event), `Some(false)` for an update, `None` for an unknown session.
    pub fn set_identity(&mut self, session_id: u64, identity: Identity) -> Option<bool> {
        let connection = self.connections.get_mut(&session_id)?;
        let newly_attached = connection.identity.is_none();
        connection.identity = Some(identity);
        Some(newly_attached)
    }

    pub fn identity_of(&self, session_id: u64) -> Option<Identity> {
        self.connections
            .get(&session_id)
            .and_then(|connection| connection.identity.clone())
    }

    // Get current clients count
    pub fn client_count(&self) -> usize {
        self.connections.len()
    }

    /// Remove every session at once; used by shutdown to drop all writer
    /// channels in one pass
    pub fn drain(&mut self) -> Vec<Connection> {
        self.connections.drain().map(|(_, conn)| conn).collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Thread-safe registry wrapper
pub type Registry = Arc<Mutex<SessionRegistry>>;

// Create a new thread-safe session registry
pub fn create_registry() -> Registry {
    Arc::new(Mutex::new(SessionRegistry::new()))
}

// Acquire the registry lock, converting poison into a crate error
pub fn lock_registry(registry: &Registry) -> Result<MutexGuard<'_, SessionRegistry>> {
    registry.lock().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn test_connection(id: u64) -> Connection {
        let (tx, _rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        Connection::new(id, addr, tx)
    }

    #[test]
    fn test_add_and_remove() {
        let mut registry = SessionRegistry::new();
        registry.add(test_connection(1));
        registry.add(test_connection(2));
        assert_eq!(registry.client_count(), 2);

        assert!(registry.remove(1).is_some());
        assert_eq!(registry.client_count(), 1);

        // Removal is idempotent
        assert!(registry.remove(1).is_none());
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn test_snapshot_reflects_membership() {
        let mut registry = SessionRegistry::new();
        for id in 1..=5 {
            registry.add(test_connection(id));
        }
        registry.remove(3);

        let mut ids: Vec<u64> = registry.snapshot().iter().map(|c| c.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_identity_first_attach_then_update() {
        let mut registry = SessionRegistry::new();
        registry.add(test_connection(7));

        let first = Identity {
            username: "Alice".to_string(),
            avatar: None,
        };
        assert_eq!(registry.set_identity(7, first), Some(true));

        let update = Identity {
            username: "Alice2".to_string(),
            avatar: Some("YQ==".to_string()),
        };
        assert_eq!(registry.set_identity(7, update.clone()), Some(false));
        assert_eq!(registry.identity_of(7), Some(update));

        assert_eq!(registry.set_identity(99, Identity { username: "x".into(), avatar: None }), None);
    }

    #[test]
    fn test_concurrent_add_remove_is_consistent() {
        let registry = create_registry();
        let mut handles = Vec::new();

        // Four workers each add 50 sessions and remove every even one
        for worker in 0u64..4 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let id = worker * 100 + i;
                    lock_registry(&registry).unwrap().add(test_connection(id));
                    if i % 2 == 0 {
                        lock_registry(&registry).unwrap().remove(id);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let registry = lock_registry(&registry).unwrap();
        assert_eq!(registry.client_count(), 4 * 25);

        let mut ids: Vec<u64> = registry.snapshot().iter().map(|c| c.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4 * 25, "snapshot must not contain duplicates");
    }
}
