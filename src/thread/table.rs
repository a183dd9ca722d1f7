//! Arena of thread control blocks.
//!
//! Threads are addressed by [`Tid`], which pairs a slot index with the
//! slot's generation. Reaping a thread bumps the generation, so a handle to a
//! reaped thread never aliases a later thread reusing the same slot.
use super::{Thread, Tid, kern::fatal};

struct Slot {
    generation: u32,
    thread: Option<Thread>,
}

/// Storage of every thread that is alive or dead but not yet reaped.
pub(crate) struct ThreadTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl ThreadTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Number of occupied slots.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Allocates a slot and stores the thread built by `f` into it.
    pub(crate) fn insert_with(&mut self, f: impl FnOnce(Tid) -> Thread) -> Tid {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    thread: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let entry = &mut self.slots[slot as usize];
        let tid = Tid::new(slot, entry.generation);
        entry.thread = Some(f(tid));
        self.len += 1;
        tid
    }

    pub(crate) fn get(&self, tid: Tid) -> Option<&Thread> {
        self.slots
            .get(tid.slot())
            .filter(|entry| entry.generation == tid.generation())
            .and_then(|entry| entry.thread.as_ref())
    }

    pub(crate) fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.slots
            .get_mut(tid.slot())
            .filter(|entry| entry.generation == tid.generation())
            .and_then(|entry| entry.thread.as_mut())
    }

    /// Looks up a thread that some queue or the scheduler still refers to.
    ///
    /// A dangling reference means the queue linkage is corrupted, which is
    /// not recoverable.
    pub(crate) fn linked(&self, tid: Tid) -> &Thread {
        match self.get(tid) {
            Some(th) => th,
            None => fatal(format_args!("dangling thread reference {tid}")),
        }
    }

    /// Mutable counterpart of [`ThreadTable::linked`].
    pub(crate) fn linked_mut(&mut self, tid: Tid) -> &mut Thread {
        match self.get_mut(tid) {
            Some(th) => th,
            None => fatal(format_args!("dangling thread reference {tid}")),
        }
    }

    /// Reclaims the slot of `tid`.
    pub(crate) fn remove(&mut self, tid: Tid) -> Option<Thread> {
        let entry = self
            .slots
            .get_mut(tid.slot())
            .filter(|entry| entry.generation == tid.generation())?;
        let th = entry.thread.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(tid.slot() as u32);
        self.len -= 1;
        Some(th)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.slots.iter().filter_map(|entry| entry.thread.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Priority;

    fn spare(table: &mut ThreadTable) -> Tid {
        table.insert_with(|tid| Thread::stub(tid, Priority::DEFAULT))
    }

    #[test]
    fn reaped_handles_go_stale() {
        let mut table = ThreadTable::new();
        let first = spare(&mut table);
        assert_eq!(table.len(), 1);
        assert!(table.remove(first).is_some());
        assert!(table.get(first).is_none());

        let second = spare(&mut table);
        assert_eq!(first.slot(), second.slot());
        assert_ne!(first, second);
        assert!(table.get(first).is_none());
        assert!(table.remove(first).is_none());
        assert_eq!(table.get(second).map(|th| th.tid), Some(second));
    }

    #[test]
    fn iterates_live_slots() {
        let mut table = ThreadTable::new();
        let tids: Vec<_> = (0..4).map(|_| spare(&mut table)).collect();
        table.remove(tids[1]);
        let seen: Vec<_> = table.iter().map(|th| th.tid).collect();
        assert_eq!(seen, vec![tids[0], tids[2], tids[3]]);
    }
}
