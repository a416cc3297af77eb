//! Per-thread extension slots
//!
//! One slot per API followed by the configured number of user slots. The
//! table lives beside the thread pool so that API layers can attach data
//! to a thread without widening its control block.

use alloc::boxed::Box;
use alloc::vec;
use core::num::NonZeroUsize;

use hashbrown::HashMap;

use crate::error::{ScoreError, ScoreResult};
use crate::score::Score;

use super::{ThreadApi, ThreadId};

pub type ExtensionValue = NonZeroUsize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionSlot {
    Api(ThreadApi),
    User(usize),
}

#[derive(Debug)]
pub struct ExtensionTable {
    user_slots: usize,
    slots: HashMap<ThreadId, Box<[Option<ExtensionValue>]>>,
}

impl ExtensionTable {
    pub fn new(user_slots: usize, capacity: usize) -> Self {
        Self {
            user_slots,
            slots: HashMap::with_capacity(capacity),
        }
    }

    pub fn slot_count(&self) -> usize {
        ThreadApi::COUNT + self.user_slots
    }

    fn index(&self, slot: ExtensionSlot) -> ScoreResult<usize> {
        match slot {
            ExtensionSlot::Api(api) => Ok(api.index()),
            ExtensionSlot::User(user) if user < self.user_slots => Ok(ThreadApi::COUNT + user),
            ExtensionSlot::User(user) => Err(ScoreError::InvalidExtensionSlot {
                slot: user,
                count: self.user_slots,
            }),
        }
    }

    pub(crate) fn attach(&mut self, id: ThreadId) {
        let slots = vec![None; self.slot_count()].into_boxed_slice();
        self.slots.insert(id, slots);
    }

    pub(crate) fn detach(&mut self, id: ThreadId) -> bool {
        self.slots.remove(&id).is_some()
    }

    pub fn get(&self, id: ThreadId, slot: ExtensionSlot) -> ScoreResult<Option<ExtensionValue>> {
        let index = self.index(slot)?;
        let slots = self.slots.get(&id).ok_or(ScoreError::InvalidId { id })?;
        Ok(slots[index])
    }

    /// Store `value`, returning what the slot held before
    pub fn set(
        &mut self,
        id: ThreadId,
        slot: ExtensionSlot,
        value: Option<ExtensionValue>,
    ) -> ScoreResult<Option<ExtensionValue>> {
        let index = self.index(slot)?;
        let slots = self.slots.get_mut(&id).ok_or(ScoreError::InvalidId { id })?;
        Ok(core::mem::replace(&mut slots[index], value))
    }
}

impl Score {
    pub fn extensions(&self) -> &ExtensionTable {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut ExtensionTable {
        &mut self.extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::tests::thread_id;

    fn value(raw: usize) -> Option<ExtensionValue> {
        NonZeroUsize::new(raw)
    }

    #[test]
    fn test_slots_are_per_thread() {
        let mut table = ExtensionTable::new(2, 4);
        table.attach(thread_id(1));
        table.attach(thread_id(2));

        let slot = ExtensionSlot::User(1);
        assert_eq!(table.set(thread_id(1), slot, value(0xdead)), Ok(None));
        assert_eq!(table.get(thread_id(1), slot), Ok(value(0xdead)));
        assert_eq!(table.get(thread_id(2), slot), Ok(None));
        assert_eq!(
            table.get(thread_id(1), ExtensionSlot::Api(ThreadApi::Posix)),
            Ok(None)
        );
    }

    #[test]
    fn test_out_of_range_user_slot() {
        let mut table = ExtensionTable::new(1, 1);
        table.attach(thread_id(1));
        assert_eq!(
            table.get(thread_id(1), ExtensionSlot::User(1)),
            Err(ScoreError::InvalidExtensionSlot { slot: 1, count: 1 })
        );
    }

    #[test]
    fn test_detached_thread_is_invalid() {
        let mut table = ExtensionTable::new(1, 1);
        table.attach(thread_id(1));
        assert!(table.detach(thread_id(1)));
        assert_eq!(
            table.get(thread_id(1), ExtensionSlot::User(0)),
            Err(ScoreError::InvalidId { id: thread_id(1) })
        );
    }
}
