use super::{Event, EventPtr, ReuseToken};
use std::sync::Arc;

/// Counters describing an [`EventPool`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Events handed out and not yet recycled
    pub in_use: usize,
    /// Idle events ready for reuse
    pub free: usize,
    /// Events ever allocated
    pub created: u64,
    /// Acquisitions served from the free list
    pub reused: u64,
}

/// Free list of base events keyed by reuse token
///
/// The pool never decides on its own that an event can be reused. The owning
/// stream passes a predicate to [`recycle_where`](Self::recycle_where), which
/// must only accept signaled events that nobody outside the pool references.
pub struct EventPool {
    queue_id: u64,
    profiling: bool,
    capacity: usize,
    slots: Vec<Option<EventPtr>>,
    in_use: Vec<u32>,
    free: Vec<u32>,
    created: u64,
    reused: u64,
}

impl EventPool {
    pub fn new(queue_id: u64, capacity: usize, profiling: bool) -> Self {
        Self {
            queue_id,
            profiling,
            capacity,
            slots: Vec::new(),
            in_use: Vec::new(),
            free: Vec::new(),
            created: 0,
            reused: 0,
        }
    }

    /// A pending base event for submission `stamp`, recycled when possible.
    pub fn acquire(&mut self, stamp: u64) -> EventPtr {
        while let Some(slot) = self.free.pop() {
            if let Some(event) = self.slots[slot as usize].clone() {
                event.reset(stamp, self.profiling);
                self.in_use.push(slot);
                self.reused += 1;
                return event;
            }
        }

        let slot = self.slots.len() as u32;
        let event = Arc::new(Event::base(
            self.queue_id,
            stamp,
            Some(ReuseToken { slot, generation: 0 }),
            self.profiling,
        ));
        self.slots.push(Some(event.clone()));
        self.in_use.push(slot);
        self.created += 1;
        event
    }

    /// Move in-use events accepted by `reusable` to the free list.
    ///
    /// Events beyond the pool capacity are dropped instead of retained.
    /// Returns the number of events recycled.
    pub fn recycle_where(&mut self, reusable: impl Fn(&EventPtr) -> bool) -> usize {
        let mut recycled = 0;
        let mut still_used = Vec::with_capacity(self.in_use.len());
        for slot in std::mem::take(&mut self.in_use) {
            let accepted = self.slots[slot as usize].as_ref().is_some_and(&reusable);
            if !accepted {
                still_used.push(slot);
                continue;
            }
            recycled += 1;
            if self.free.len() < self.capacity {
                self.free.push(slot);
            } else {
                self.slots[slot as usize] = None;
            }
        }
        self.in_use = still_used;
        recycled
    }

    /// Recycle what `reusable` accepts and forget every other in-use event.
    ///
    /// Forgotten events stay valid for whoever still holds them; the pool
    /// just stops tracking them. Returns `(recycled, orphaned)`.
    pub fn reset(&mut self, reusable: impl Fn(&EventPtr) -> bool) -> (usize, usize) {
        let recycled = self.recycle_where(reusable);
        let orphaned = self.in_use.len();
        for slot in std::mem::take(&mut self.in_use) {
            self.slots[slot as usize] = None;
        }
        (recycled, orphaned)
    }

    /// In-use events still held outside the pool
    pub fn referenced(&self) -> usize {
        self.in_use
            .iter()
            .filter_map(|&slot| self.slots[slot as usize].as_ref())
            .filter(|event| Arc::strong_count(event) > 1)
            .count()
    }

    /// Drop every event the pool holds.
    pub fn release(&mut self) {
        self.slots.clear();
        self.in_use.clear();
        self.free.clear();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            in_use: self.in_use.len(),
            free: self.free.len(),
            created: self.created,
            reused: self.reused,
        }
    }
}
