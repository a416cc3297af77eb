//! Per-thread storage keys
//!
//! A key names one value slot in every thread. Values sit in a side table
//! keyed by thread handle, so threads that never touch a key cost nothing.
//! When a thread is freed each of its values goes to the destructor of its
//! key. Deleting a key drops its values without calling the destructor.

use alloc::vec::Vec;
use core::fmt;
use core::num::NonZeroUsize;

use hashbrown::HashMap;

use crate::error::{ScoreError, ScoreResult};
use crate::score::Score;

use super::ThreadId;

pub type KeyValue = NonZeroUsize;

/// Called with a thread's value when the thread goes away
pub type KeyDestructor = fn(KeyValue);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u32);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key{}", self.0)
    }
}

#[derive(Debug)]
pub struct KeyTable {
    keys: HashMap<KeyId, Option<KeyDestructor>>,
    values: HashMap<ThreadId, HashMap<KeyId, KeyValue>>,
    next: u32,
    maximum: usize,
}

impl KeyTable {
    pub fn new(maximum: usize) -> Self {
        Self {
            keys: HashMap::with_capacity(maximum),
            values: HashMap::new(),
            next: 1,
            maximum,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn create(&mut self, destructor: Option<KeyDestructor>) -> ScoreResult<KeyId> {
        if self.keys.len() >= self.maximum {
            return Err(ScoreError::KeysExhausted {
                maximum: self.maximum,
            });
        }
        // Identifiers are never reused
        let key = KeyId(self.next);
        self.next = self.next.checked_add(1).ok_or(ScoreError::KeysExhausted {
            maximum: self.maximum,
        })?;
        self.keys.insert(key, destructor);
        Ok(key)
    }

    pub fn delete(&mut self, key: KeyId) -> ScoreResult<()> {
        self.keys.remove(&key).ok_or(ScoreError::InvalidKey { key })?;
        for values in self.values.values_mut() {
            values.remove(&key);
        }
        self.values.retain(|_, values| !values.is_empty());
        Ok(())
    }

    pub fn get(&self, id: ThreadId, key: KeyId) -> ScoreResult<Option<KeyValue>> {
        if !self.keys.contains_key(&key) {
            return Err(ScoreError::InvalidKey { key });
        }
        Ok(self
            .values
            .get(&id)
            .and_then(|values| values.get(&key))
            .copied())
    }

    /// Store `value` for `id`, returning the previous value
    pub fn set(&mut self, id: ThreadId, key: KeyId, value: Option<KeyValue>) -> ScoreResult<Option<KeyValue>> {
        if !self.keys.contains_key(&key) {
            return Err(ScoreError::InvalidKey { key });
        }
        let previous = match value {
            Some(value) => self.values.entry(id).or_default().insert(key, value),
            None => {
                let previous = self.values.get_mut(&id).and_then(|values| values.remove(&key));
                if self.values.get(&id).map_or(false, |values| values.is_empty()) {
                    self.values.remove(&id);
                }
                previous
            }
        };
        Ok(previous)
    }

    /// Drop every value of `id`, running destructors in key order
    pub(crate) fn release(&mut self, id: ThreadId) -> usize {
        let Some(values) = self.values.remove(&id) else {
            return 0;
        };
        let mut values: Vec<(KeyId, KeyValue)> = values.into_iter().collect();
        values.sort_unstable_by_key(|&(key, _)| key);
        for &(key, value) in &values {
            if let Some(destructor) = self.keys.get(&key).copied().flatten() {
                destructor(value);
            }
        }
        values.len()
    }
}

impl Score {
    pub fn key_create(&mut self, destructor: Option<KeyDestructor>) -> ScoreResult<KeyId> {
        let key = self.keys.create(destructor)?;
        log::debug!("[KEYS] created {}", key);
        Ok(key)
    }

    pub fn key_delete(&mut self, key: KeyId) -> ScoreResult<()> {
        self.keys.delete(key)
    }

    pub fn key_get(&self, id: ThreadId, key: KeyId) -> ScoreResult<Option<KeyValue>> {
        self.thread_or_err(id)?;
        self.keys.get(id, key)
    }

    pub fn key_set(&mut self, id: ThreadId, key: KeyId, value: Option<KeyValue>) -> ScoreResult<Option<KeyValue>> {
        self.thread_or_err(id)?;
        self.keys.set(id, key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoreConfig;
    use crate::scheduler::edf::deadline;
    use crate::thread::tests::thread_id;
    use crate::thread::ThreadAttributes;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn value(raw: usize) -> Option<KeyValue> {
        NonZeroUsize::new(raw)
    }

    #[test]
    fn test_values_are_per_thread() {
        let mut table = KeyTable::new(2);
        let key = table.create(None).unwrap();
        assert_eq!(table.set(thread_id(1), key, value(7)), Ok(None));
        assert_eq!(table.get(thread_id(1), key), Ok(value(7)));
        assert_eq!(table.get(thread_id(2), key), Ok(None));

        assert_eq!(table.set(thread_id(1), key, None), Ok(value(7)));
        assert_eq!(table.get(thread_id(1), key), Ok(None));
    }

    #[test]
    fn test_key_limit_and_deletion() {
        let mut table = KeyTable::new(1);
        let key = table.create(None).unwrap();
        assert_eq!(
            table.create(None),
            Err(ScoreError::KeysExhausted { maximum: 1 })
        );

        table.set(thread_id(1), key, value(3)).unwrap();
        table.delete(key).unwrap();
        assert_eq!(table.get(thread_id(1), key), Err(ScoreError::InvalidKey { key }));
        assert_eq!(table.delete(key), Err(ScoreError::InvalidKey { key }));

        let again = table.create(None).unwrap();
        assert_ne!(again, key);
        assert_eq!(table.release(thread_id(1)), 0);
    }

    static DESTROYED: AtomicUsize = AtomicUsize::new(0);

    fn destroy(value: KeyValue) {
        DESTROYED.fetch_add(value.get(), Ordering::SeqCst);
    }

    #[test]
    fn test_thread_free_runs_destructors() {
        let mut score = Score::new(ScoreConfig::uniprocessor()).unwrap();
        let with_dtor = score.key_create(Some(destroy)).unwrap();
        let plain = score.key_create(None).unwrap();
        let id = score
            .thread_create(&ThreadAttributes::new("K", deadline(10)))
            .unwrap();
        score.key_set(id, with_dtor, value(40)).unwrap();
        score.key_set(id, plain, value(2)).unwrap();
        assert_eq!(score.key_get(id, with_dtor), Ok(value(40)));

        score.request_terminate(id, None).unwrap();
        assert_eq!(score.kill_zombies(), 1);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 40);
        assert_eq!(score.key_get(id, plain), Err(ScoreError::InvalidId { id }));
        assert_eq!(score.keys.get(id, plain), Ok(None));
    }
}
