use std::any::Any;
use std::collections::HashMap;

/// Memoized lookups scoped to one pipeline run.
///
/// Created by the caller before a run and dropped after it, so nothing
/// cached here outlives the job that computed it.
#[derive(Default)]
pub struct RunCache {
    entries: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl RunCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.entries.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Box::new(value));
    }

    /// Return the cached value, computing and storing it on first use.
    ///
    /// A value of a different type under the same key is replaced.
    pub fn get_or_insert_with<T, F>(&mut self, key: &str, init: F) -> &T
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let fresh = !matches!(self.entries.get(key), Some(v) if v.is::<T>());
        if fresh {
            self.entries.insert(key.to_string(), Box::new(init()));
        }
        self.entries
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .expect("entry inserted above with matching type")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
