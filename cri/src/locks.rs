//! Per-ID operation locks.
//!
//! Operations on the same sandbox or container ID are serialized;
//! operations on different IDs proceed in parallel. The lock is held for
//! the duration of one lifecycle operation, never across unrelated IDs.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-ID async mutexes.
pub struct OpLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl OpLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquire the lock for an ID, creating it on first use.
    pub async fn hold(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the registry entry once the ID's record is gone. Waiters
    /// already holding a clone of the Arc are unaffected.
    pub fn forget(&self, id: &str) {
        self.locks.remove(id);
    }
}

impl Default for OpLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_same_id_serializes() {
        let locks = Arc::new(OpLocks::new());
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let in_section = in_section.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.hold("sb-1").await;
                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_ids_run_concurrently() {
        let locks = OpLocks::new();
        let _a = locks.hold("sb-1").await;
        // Must not deadlock on a different ID while sb-1 is held.
        let _b = locks.hold("sb-2").await;
    }

    #[tokio::test]
    async fn test_forget_releases_entry() {
        let locks = OpLocks::new();
        {
            let _guard = locks.hold("sb-1").await;
        }
        locks.forget("sb-1");
        // Re-acquiring after forget creates a fresh lock.
        let _guard = locks.hold("sb-1").await;
    }
}
