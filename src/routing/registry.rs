//! Registry of connections that are still being routed.
//!
//! Shared by every connection task, so it is backed by a sharded concurrent
//! map. Operations for one id only ever come from that connection's own
//! task; the map only has to keep different connections apart.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;

/// Identifier assigned to a connection when it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Map of in-flight routing entries keyed by connection id.
///
/// Removal is erase-once: the first `remove` hands the entry back, every
/// later one returns `None`.
pub struct ConnectionRegistry<E> {
    entries: DashMap<ConnectionId, E>,
}

impl<E> ConnectionRegistry<E> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert an entry for a newly activated connection.
    ///
    /// An existing entry is never replaced; the rejected entry is handed back.
    pub fn insert(&self, id: ConnectionId, entry: E) -> Result<(), E> {
        match self.entries.entry(id) {
            Entry::Occupied(_) => Err(entry),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Run `f` against the entry for `id`, if there is one.
    ///
    /// The entry's shard stays locked while `f` runs, so `f` must be short
    /// and must not call back into the registry.
    pub fn with_entry<R>(&self, id: ConnectionId, f: impl FnOnce(&mut E) -> R) -> Option<R> {
        self.entries.get_mut(&id).map(|mut entry| f(entry.value_mut()))
    }

    /// Remove and return the entry for `id`.
    pub fn remove(&self, id: ConnectionId) -> Option<E> {
        self.entries.remove(&id).map(|(_, entry)| entry)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of connections currently being routed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Visit every entry without removing it.
    pub fn for_each(&self, mut f: impl FnMut(ConnectionId, &E)) {
        for entry in self.entries.iter() {
            f(*entry.key(), entry.value());
        }
    }
}

impl<E> Default for ConnectionRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = ConnectionRegistry::new();
        let a = ConnectionId::new(1);
        let b = ConnectionId::new(2);

        registry.insert(a, "a").unwrap();
        registry.insert(b, "b").unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(a));

        assert_eq!(registry.remove(a), Some("a"));
        assert!(!registry.contains(a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_insert_keeps_original() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new(7);

        registry.insert(id, 1).unwrap();
        assert_eq!(registry.insert(id, 2), Err(2));
        assert_eq!(registry.with_entry(id, |v| *v), Some(1));
    }

    #[test]
    fn test_erase_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new(3);

        registry.insert(id, DropCounter(drops.clone())).ok().unwrap();

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.remove(id).is_none());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_with_entry_mutates_in_place() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new(4);
        registry.insert(id, Vec::new()).unwrap();

        registry.with_entry(id, |buf: &mut Vec<u8>| buf.extend_from_slice(b"ab"));
        registry.with_entry(id, |buf| buf.push(b'c'));

        assert_eq!(registry.remove(id).unwrap(), b"abc");
        assert!(registry.with_entry(id, |_| ()).is_none());
    }

    #[test]
    fn test_concurrent_connections() {
        let registry = Arc::new(ConnectionRegistry::new());

        let handles: Vec<_> = (0..8u64)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..100u64 {
                        let id = ConnectionId::new(worker * 1000 + i);
                        registry.insert(id, i).unwrap();
                        assert_eq!(registry.remove(id), Some(i));
                        assert!(registry.remove(id).is_none());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 0);
    }
}
