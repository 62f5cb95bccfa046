//! Insert-if-absent memoization map
//!
//! Each key owns a once-cell, so concurrent first use of the same key runs the
//! loader once while other callers wait for its result. Loads for different
//! keys never block each other. Failed loads are not cached.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Process-lifetime cache of decoded values, with no eviction
#[derive(Debug)]
pub struct Memo<K, V> {
    entries: Mutex<HashMap<K, Arc<OnceCell<Arc<V>>>>>,
}

impl<K, V> Default for Memo<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V> Memo<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`, running `load` only if none is stored yet
    pub fn get_or_try_insert_with<E, F>(&self, key: K, load: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        // The map lock is held only long enough to find the key's cell
        let cell = Arc::clone(self.entries.lock().entry(key).or_default());
        cell.get_or_try_init(|| load().map(Arc::new)).map(Arc::clone)
    }

    /// Returns the stored value for `key` without loading
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries
            .lock()
            .get(key)
            .and_then(|cell| cell.get().cloned())
    }

    /// Number of keys with a stored value
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|cell| cell.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_loads_once_per_key() {
        let memo: Memo<&str, String> = Memo::new();
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = memo
                .get_or_try_insert_with("a", || {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>("decoded".to_string())
                })
                .unwrap();
            assert_eq!(*value, "decoded");
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(memo.len(), 1);
    }

    #[test]
    fn test_failed_load_is_retried() {
        let memo: Memo<&str, u32> = Memo::new();

        let first = memo.get_or_try_insert_with("k", || Err("missing"));
        assert_eq!(first.unwrap_err(), "missing");
        assert!(memo.get(&"k").is_none());
        assert!(memo.is_empty());

        let second = memo.get_or_try_insert_with("k", || Ok::<_, &str>(7)).unwrap();
        assert_eq!(*second, 7);
        assert_eq!(memo.get(&"k").as_deref(), Some(&7));
    }

    #[test]
    fn test_concurrent_first_use_runs_loader_once() {
        let memo: Arc<Memo<u32, u32>> = Arc::new(Memo::new());
        let loads = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let memo = Arc::clone(&memo);
                let loads = Arc::clone(&loads);
                thread::spawn(move || {
                    memo.get_or_try_insert_with(1, || {
                        loads.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        Ok::<_, ()>(42)
                    })
                    .unwrap()
                })
            })
            .collect();

        let values: Vec<Arc<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }
}
