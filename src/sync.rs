use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Named write synchronizer for a single output store.
///
/// Workers writing different granules may target the same output array, and
/// every array write is a read-modify-write of whole chunks, so writes to any
/// one array must be mutually exclusive. Locks are named by array path and
/// created on first use; the synchronizer itself is keyed by the store root so
/// all workers sharing a store share the same lock registry.
#[derive(Debug)]
pub struct StoreSynchronizer {
    root: String,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl StoreSynchronizer {
    pub fn new(root: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Acquire the write lock for `array_path`, waiting if another worker
    /// holds it. The guard releases on drop.
    pub async fn lock(&self, array_path: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("synchronizer registry poisoned");
            locks
                .entry(array_path.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn same_array_writes_are_serialized() {
        let sync = StoreSynchronizer::new("store.zarr");
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sync = sync.clone();
            let in_flight = in_flight.clone();
            handles.push(tokio::spawn(async move {
                let _guard = sync.lock("data/var").await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst);
                assert_eq!(now, 0, "two writers inside the same array lock");
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn distinct_arrays_do_not_contend() {
        let sync = StoreSynchronizer::new("store.zarr");
        let _a = sync.lock("a").await;
        // Must not deadlock: a different array name is a different lock.
        let _b = sync.lock("b").await;
    }
}
