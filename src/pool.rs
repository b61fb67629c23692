//! Thread-local object pool (§4.9), grounded on `stf_pool.hpp`
//! (`original_source/`) for the bounded per-variant free-list design.
//! Rust realization: a `thread_local!` `RefCell<HashMap<Descriptor,
//! Vec<Record>>>` free list, matching the teacher's general preference
//! for simple, allocation-light, single-thread-owned data structures
//! (`raw_data.rs`) over a shared/lock-based pool.

use std::cell::RefCell;
use std::collections::HashMap;

use log::trace;

use crate::descriptor::Descriptor;
use crate::record::Record;

/// Free-list capacity per record variant.
pub const DEFAULT_CAPACITY: usize = 3072;

struct Pool {
    capacity: usize,
    free_lists: HashMap<Descriptor, Vec<Record>>,
}

impl Pool {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free_lists: HashMap::new(),
        }
    }

    fn take(&mut self, descriptor: Descriptor) -> Option<Record> {
        self.free_lists.get_mut(&descriptor).and_then(Vec::pop)
    }

    fn give_back(&mut self, record: Record) {
        let descriptor = record.descriptor();
        let list = self.free_lists.entry(descriptor).or_default();
        if list.len() < self.capacity {
            list.push(record);
        }
        // Over capacity: the record is simply dropped (really deleted),
        // per §4.9.
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let total: usize = self.free_lists.values().map(Vec::len).sum();
        trace!("draining object pool at thread exit: {total} records across {} variants", self.free_lists.len());
        self.free_lists.clear();
    }
}

thread_local! {
    static POOL: RefCell<Pool> = RefCell::new(Pool::new(DEFAULT_CAPACITY));
}

/// Takes a pooled, stale-but-reusable record for `descriptor` if one is
/// available. Callers overwrite its contents via the normal unpack path;
/// on a miss, the caller should allocate fresh.
pub fn checkout(descriptor: Descriptor) -> Option<Record> {
    POOL.with(|pool| pool.borrow_mut().take(descriptor))
}

/// Returns a record to its variant's free list for reuse, subject to
/// the per-variant capacity.
pub fn release(record: Record) {
    POOL.with(|pool| pool.borrow_mut().give_back(record));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{InstIem, Isa};

    #[test]
    fn checkout_miss_then_hit_after_release() {
        assert!(checkout(Descriptor::Isa).is_none());
        release(Record::Isa(Isa::RiscV));
        let reused = checkout(Descriptor::Isa);
        assert!(matches!(reused, Some(Record::Isa(Isa::RiscV))));
        assert!(checkout(Descriptor::Isa).is_none());
    }

    #[test]
    fn free_list_is_bounded() {
        for _ in 0..(DEFAULT_CAPACITY + 10) {
            release(Record::InstIem(InstIem::Rv64));
        }
        let mut reclaimed = 0;
        while checkout(Descriptor::InstIem).is_some() {
            reclaimed += 1;
        }
        assert_eq!(reclaimed, DEFAULT_CAPACITY);
    }
}
