//! Per-key async mutual exclusion inside one process.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A lazily created async mutex per key.
///
/// Entries are held weakly: once every guard and waiter for a key is gone
/// the mutex is freed, and dead entries are pruned on the next insert.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Weak<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        self.mutex_for(key).lock_owned().await
    }

    /// Number of keys with a live mutex.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .map(|locks| locks.values().filter(|w| w.strong_count() > 0).count())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mutex_for(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            // The map holds no invariants a panicking holder could break.
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let mutex = Arc::new(AsyncMutex::new(()));
        locks.insert(key.clone(), Arc::downgrade(&mutex));
        mutex
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive_other_keys_are_not() {
        let locks = Arc::new(KeyedLocks::<String>::new());
        let guard = locks.lock(&"a".to_string()).await;

        // A different key is immediately available.
        let _b = locks.lock(&"b".to_string()).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&"a".to_string()).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn released_keys_are_freed() {
        let locks = KeyedLocks::<u32>::new();
        {
            let _g = locks.lock(&1).await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }
}
