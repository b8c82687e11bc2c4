use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::rid_pool::SlotKind;

/// Snapshot of one registered handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveHandle {
    pub id: u64,
    pub kind: SlotKind,
    pub name: String,
}

/// Debug registry of live resource handles, used for leak reports.
/// Not on any hot path: handles register once on creation and unregister
/// when their last reference is dropped.
pub struct LiveHandleRegistry {
    /// Registration id -> (kind, debug name)
    live: DashMap<u64, (SlotKind, String)>,
    /// Counter for registration ids
    next_id: AtomicU64,
}

impl LiveHandleRegistry {
    pub fn new() -> Self {
        Self {
            live: DashMap::new(),
            // Start from 1 so 0 can never name a registration
            next_id: AtomicU64::new(1),
        }
    }

    /// Record a new live handle and return its registration id.
    pub fn register(&self, kind: SlotKind, name: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.insert(id, (kind, name.to_string()));
        id
    }

    /// Forget a handle. Returns false if the id was not registered.
    pub fn unregister(&self, id: u64) -> bool {
        self.live.remove(&id).is_some()
    }

    /// All live handles ordered by registration.
    pub fn snapshot(&self) -> Vec<LiveHandle> {
        let mut handles: Vec<LiveHandle> = self
            .live
            .iter()
            .map(|entry| {
                let (kind, name) = entry.value();
                LiveHandle {
                    id: *entry.key(),
                    kind: *kind,
                    name: name.clone(),
                }
            })
            .collect();
        handles.sort_by_key(|h| h.id);
        handles
    }

    pub fn count(&self, kind: SlotKind) -> usize {
        self.live.iter().filter(|e| e.value().0 == kind).count()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl Default for LiveHandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = LiveHandleRegistry::new();
        let a = registry.register(SlotKind::Buffer, "vertices");
        let b = registry.register(SlotKind::Image, "albedo");
        assert_ne!(a, 0);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.count(SlotKind::Buffer), 1);

        assert!(registry.unregister(a));
        assert!(!registry.unregister(a));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, b);
        assert_eq!(snapshot[0].name, "albedo");
    }

    #[test]
    fn concurrent_registration() {
        let registry = std::sync::Arc::new(LiveHandleRegistry::new());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        registry.register(SlotKind::Buffer, &format!("t{}-{}", t, i));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(registry.len(), 400);
    }
}
