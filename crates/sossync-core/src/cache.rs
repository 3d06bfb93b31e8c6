use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;

use crate::error::Result;

/// Read-through cache scoped to a single run. Entries are never evicted
/// within a run; the whole cache is dropped with the run.
#[derive(Debug, Default)]
pub struct RunCache<K, V> {
    entries: RefCell<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> RunCache<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.borrow_mut().insert(key, value);
    }

    pub fn remove(&self, key: &K) {
        self.entries.borrow_mut().remove(key);
    }

    pub fn get_or_try_insert_with(
        &self,
        key: &K,
        fetch: impl FnOnce() -> Result<V>,
    ) -> Result<V> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let value = fetch()?;
        self.insert(key.clone(), value.clone());
        Ok(value)
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_through_fetches_once() {
        let cache: RunCache<String, u32> = RunCache::new();
        let mut fetches = 0;

        for _ in 0..3 {
            let value = cache
                .get_or_try_insert_with(&"k".to_string(), || {
                    fetches += 1;
                    Ok(7)
                })
                .unwrap();
            assert_eq!(value, 7);
        }

        assert_eq!(fetches, 1);
    }

    #[test]
    fn remove_and_clear() {
        let cache: RunCache<&'static str, u32> = RunCache::new();
        cache.insert("a", 1);
        cache.insert("b", 2);

        cache.remove(&"a");
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));

        cache.clear();
        assert_eq!(cache.get(&"b"), None);
    }
}
