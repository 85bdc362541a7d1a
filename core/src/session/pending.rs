// Pending slots — one outstanding request per destination prefix
//
// Used for logins and status requests (a new registration supersedes the old
// one) and for raw CLI passthrough (a busy slot rejects the newcomer). Every
// registration carries a generation so a guard dropped after being
// superseded cannot release its successor.

use crate::identity::KeyPrefix;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

/// What a waiter receives
#[derive(Debug, Clone, PartialEq)]
pub enum SlotResult<T> {
    Resolved(T),
    /// A newer request for the same destination took the slot
    Superseded,
}

struct Slot<T> {
    generation: u64,
    sender: oneshot::Sender<SlotResult<T>>,
}

struct Slots<T> {
    entries: HashMap<KeyPrefix, Slot<T>>,
    next_generation: u64,
}

pub struct PendingSlots<T> {
    inner: Mutex<Slots<T>>,
}

/// Releases a registration when dropped
pub struct SlotGuard<'a, T> {
    slots: &'a PendingSlots<T>,
    prefix: KeyPrefix,
    generation: u64,
}

impl<T> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        self.slots.release(&self.prefix, self.generation);
    }
}

impl<T> Default for PendingSlots<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingSlots<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Slots {
                entries: HashMap::new(),
                next_generation: 1,
            }),
        }
    }

    /// Take the slot, signalling any current waiter that it was superseded
    pub fn register(
        &self,
        prefix: KeyPrefix,
    ) -> (SlotGuard<'_, T>, oneshot::Receiver<SlotResult<T>>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        let generation = inner.next_generation;
        inner.next_generation += 1;

        if let Some(previous) = inner.entries.insert(
            prefix,
            Slot {
                generation,
                sender: tx,
            },
        ) {
            debug!("Pending request for {} superseded", prefix);
            let _ = previous.sender.send(SlotResult::Superseded);
        }

        (
            SlotGuard {
                slots: self,
                prefix,
                generation,
            },
            rx,
        )
    }

    /// Take the slot only if it is free
    pub fn try_register(
        &self,
        prefix: KeyPrefix,
    ) -> Option<(SlotGuard<'_, T>, oneshot::Receiver<SlotResult<T>>)> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&prefix) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.entries.insert(
            prefix,
            Slot {
                generation,
                sender: tx,
            },
        );
        Some((
            SlotGuard {
                slots: self,
                prefix,
                generation,
            },
            rx,
        ))
    }

    /// Hand a value to the waiter for `prefix`; false when nobody is waiting
    pub fn resolve(&self, prefix: &KeyPrefix, value: T) -> bool {
        let slot = self.inner.lock().entries.remove(prefix);
        match slot {
            Some(slot) => slot.sender.send(SlotResult::Resolved(value)).is_ok(),
            None => false,
        }
    }

    pub fn is_pending(&self, prefix: &KeyPrefix) -> bool {
        self.inner.lock().entries.contains_key(prefix)
    }

    fn release(&self, prefix: &KeyPrefix, generation: u64) {
        let mut inner = self.inner.lock();
        if inner
            .entries
            .get(prefix)
            .is_some_and(|slot| slot.generation == generation)
        {
            inner.entries.remove(prefix);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(byte: u8) -> KeyPrefix {
        KeyPrefix::from_bytes([byte; 6])
    }

    #[test]
    fn test_register_supersedes_previous_waiter() {
        let slots: PendingSlots<u32> = PendingSlots::new();
        let (first_guard, mut first_rx) = slots.register(prefix(1));
        let (_second_guard, mut second_rx) = slots.register(prefix(1));

        assert_eq!(first_rx.try_recv().unwrap(), SlotResult::Superseded);

        // The stale guard must not release the newer registration
        drop(first_guard);
        assert!(slots.is_pending(&prefix(1)));

        assert!(slots.resolve(&prefix(1), 7));
        assert_eq!(second_rx.try_recv().unwrap(), SlotResult::Resolved(7));
    }

    #[test]
    fn test_try_register_rejects_busy_slot() {
        let slots: PendingSlots<String> = PendingSlots::new();
        let held = slots.try_register(prefix(2));
        assert!(held.is_some());
        assert!(slots.try_register(prefix(2)).is_none());
        assert!(slots.try_register(prefix(3)).is_some());

        drop(held);
        assert!(slots.try_register(prefix(2)).is_some());
    }

    #[test]
    fn test_resolve_without_waiter() {
        let slots: PendingSlots<u8> = PendingSlots::new();
        assert!(!slots.resolve(&prefix(9), 1));
    }

    #[test]
    fn test_resolve_consumes_slot() {
        let slots: PendingSlots<u8> = PendingSlots::new();
        let (_guard, _rx) = slots.register(prefix(4));
        assert!(slots.resolve(&prefix(4), 1));
        assert!(!slots.resolve(&prefix(4), 2));
        assert!(!slots.is_pending(&prefix(4)));
    }
}
