//! Identity and dedup bookkeeping shared by every capture channel.
//!
//! Message keys are a monotonic seen-set with no eviction. DOM nodes are
//! tracked only through weak references so the store never keeps a detached
//! node alive; dead entries are dropped by periodic liveness sweeps.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, Weak},
};

use pagetap_host::{DomNode, NodeHandle};

#[derive(Debug)]
struct NodeAttempts {
    count: u32,
    node: Weak<dyn DomNode>,
}

pub struct DedupStore {
    seen: Mutex<HashSet<String>>,
    handled: Mutex<HashMap<u64, Weak<dyn DomNode>>>,
    attempts: Mutex<HashMap<u64, NodeAttempts>>,
    max_attempts: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DedupStore {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            handled: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            max_attempts,
        }
    }

    /// True exactly once per key; records the key on first sight.
    pub fn should_emit(&self, key: &str) -> bool {
        lock(&self.seen).insert(key.to_string())
    }

    #[must_use]
    pub fn seen_len(&self) -> usize {
        lock(&self.seen).len()
    }

    /// Whether the node was already converted to a message. An entry whose
    /// node has been dropped is moot and is cleared on the way out.
    pub fn is_node_handled(&self, node: &NodeHandle) -> bool {
        let mut handled = lock(&self.handled);
        match handled.get(&node.node_id()) {
            Some(weak) if weak.upgrade().is_some() => true,
            Some(_) => {
                handled.remove(&node.node_id());
                false
            },
            None => false,
        }
    }

    pub fn mark_node_handled(&self, node: &NodeHandle) {
        lock(&self.handled).insert(node.node_id(), std::sync::Arc::downgrade(node));
    }

    /// Count one extraction attempt against the node and return the total.
    pub fn record_attempt(&self, node: &NodeHandle) -> u32 {
        let mut attempts = lock(&self.attempts);
        let entry = attempts.entry(node.node_id()).or_insert_with(|| NodeAttempts {
            count: 0,
            node: std::sync::Arc::downgrade(node),
        });
        entry.count = entry.count.saturating_add(1);
        entry.count
    }

    /// Whether the node has hit the attempt cap and must not be rescheduled.
    #[must_use]
    pub fn attempts_exhausted(&self, node: &NodeHandle) -> bool {
        lock(&self.attempts)
            .get(&node.node_id())
            .is_some_and(|entry| entry.count >= self.max_attempts)
    }

    /// Drop bookkeeping for nodes the host has released.
    pub fn sweep(&self) {
        lock(&self.handled).retain(|_, weak| weak.upgrade().is_some());
        lock(&self.attempts).retain(|_, entry| entry.node.upgrade().is_some());
    }

    #[cfg(test)]
    fn tracked_nodes(&self) -> usize {
        lock(&self.handled).len() + lock(&self.attempts).len()
    }
}
