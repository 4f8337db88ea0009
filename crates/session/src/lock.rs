//! Single-flight interaction lock
//!
//! At most one interactive login runs per session. `try_acquire` is a
//! synchronous check-and-set, so two tasks racing to log in cannot both get
//! past it before either suspends.
//!
//! Each acquisition gets a generation number. Stuck-interaction recovery may
//! `clear()` the lock out from under its holder; the stale guard then drops
//! without touching a newer holder's lock.

use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Slot {
    holder: Option<u64>,
    next_generation: u64,
}

#[derive(Debug, Default)]
pub struct InteractionLock {
    slot: Mutex<Slot>,
}

impl InteractionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock, or `None` if an interaction is already in flight.
    pub fn try_acquire(&self) -> Option<InteractionGuard<'_>> {
        let mut slot = self.slot();
        if slot.holder.is_some() {
            return None;
        }
        let generation = slot.next_generation;
        slot.next_generation = slot.next_generation.wrapping_add(1);
        slot.holder = Some(generation);
        Some(InteractionGuard {
            lock: self,
            generation,
        })
    }

    pub fn is_held(&self) -> bool {
        self.slot().holder.is_some()
    }

    /// Force-release regardless of holder. Returns whether it was held.
    pub fn clear(&self) -> bool {
        self.slot().holder.take().is_some()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the lock on drop, unless it was cleared and re-acquired since.
#[derive(Debug)]
pub struct InteractionGuard<'a> {
    lock: &'a InteractionLock,
    generation: u64,
}

impl Drop for InteractionGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.lock.slot();
        if slot.holder == Some(self.generation) {
            slot.holder = None;
        }
    }
}
