//! The slot pool and its indexes: a pre-allocated `Vec` of slots addressed
//! by small integer handles, an `FxHashMap` from transaction key to handle,
//! and three lists threaded through handle fields on the slots themselves.
//! Free is singly linked; active and callback-ready are doubly linked with
//! head and tail, so removal is O(1).

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::error::TransportError;
use crate::protocol::Niceness;
use crate::slot::{ListId, Slot, SlotKey};

/// Index of a slot in the pool. Handles are stable for the lifetime of the
/// transaction occupying the slot and are recycled afterwards.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct SlotHandle(pub(crate) u32);

#[derive(Debug, Clone, Copy, Default)]
struct ListEnds {
    head: Option<SlotHandle>,
    tail: Option<SlotHandle>,
}

pub(crate) struct SlotTable {
    slots: Vec<Slot>,
    index: FxHashMap<SlotKey, SlotHandle>,
    free_head: Option<SlotHandle>,
    active: ListEnds,
    ready: ListEnds,
    used: usize,
    used_incoming: usize,
    detached: usize,
}

impl SlotTable {
    pub(crate) fn new(pool_size: usize) -> SlotTable {
        let mut slots = Vec::with_capacity(pool_size);
        let mut free_head = None;
        // thread the free list back to front so slot 0 is handed out first
        for i in (0..pool_size).rev() {
            let mut slot = Slot::unused();
            slot.next = free_head;
            free_head = Some(SlotHandle(i as u32));
            slots.push(slot);
        }
        slots.reverse();

        SlotTable {
            slots,
            index: FxHashMap::default(),
            free_head,
            active: ListEnds::default(),
            ready: ListEnds::default(),
            used: 0,
            used_incoming: 0,
            detached: 0,
        }
    }

    pub(crate) fn slot(&self, h: SlotHandle) -> &Slot {
        &self.slots[h.0 as usize]
    }

    pub(crate) fn slot_mut(&mut self, h: SlotHandle) -> &mut Slot {
        &mut self.slots[h.0 as usize]
    }

    pub(crate) fn lookup(&self, key: &SlotKey) -> Option<SlotHandle> {
        self.index.get(key).copied()
    }

    /// True if `h` currently names a live slot with exactly this key. Used
    /// to validate reply tokens that may outlive their slot.
    pub(crate) fn is_live(&self, h: SlotHandle, key: &SlotKey) -> bool {
        self.lookup(key) == Some(h)
    }

    pub(crate) fn used_count(&self) -> usize {
        self.used
    }

    pub(crate) fn free_count(&self) -> usize {
        self.slots.len() - self.used
    }

    pub(crate) fn used_incoming_count(&self) -> usize {
        self.used_incoming
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.used == 0
    }

    /// Take a slot from the free list and register it in the hash index and
    /// the active list. The slot is handed back reset but unprimed.
    pub(crate) fn allocate(&mut self, key: SlotKey) -> Result<SlotHandle, TransportError> {
        if self.index.contains_key(&key) {
            return Err(TransportError::BadCall("transaction key already in use"));
        }
        let h = self.free_head.ok_or(TransportError::NoSlots)?;

        self.free_head = self.slot(h).next;
        self.used += 1;
        if key.incoming {
            self.used_incoming += 1;
        }

        let slot = self.slot_mut(h);
        slot.next = None;
        slot.prev = None;
        slot.list = ListId::Detached;
        slot.reset();
        slot.key = key;
        self.detached += 1;

        self.index.insert(key, h);
        self.attach_active(h);
        Ok(h)
    }

    /// Unlink from whatever list the slot is on, unregister the key, and
    /// return the slot to the free list.
    pub(crate) fn free(&mut self, h: SlotHandle) {
        self.unlink(h);
        self.detached -= 1;
        let key = self.slot(h).key;
        self.index.remove(&key);

        self.used -= 1;
        if key.incoming {
            self.used_incoming -= 1;
        }

        let old_free_head = self.free_head;
        let slot = self.slot_mut(h);
        slot.reset();
        slot.list = ListId::Free;
        slot.prev = None;
        slot.next = old_free_head;
        self.free_head = Some(h);
    }

    /// Re-register a live slot under a new key (host replacement). Fails if
    /// the new key is already taken.
    pub(crate) fn rekey(&mut self, h: SlotHandle, new_key: SlotKey) -> bool {
        if self.index.contains_key(&new_key) {
            warn!("cannot retarget slot {:?}: new key {:?} is already in use", h, new_key);
            return false;
        }
        let old_key = self.slot(h).key;
        self.index.remove(&old_key);
        self.index.insert(new_key, h);
        self.slot_mut(h).key = new_key;
        true
    }

    // --- list plumbing ---------------------------------------------------

    fn list_ends(&mut self, list: ListId) -> &mut ListEnds {
        match list {
            ListId::Active => &mut self.active,
            ListId::Ready => &mut self.ready,
            ListId::Free | ListId::Detached => unreachable!("not a linked list"),
        }
    }

    /// Remove the slot from its doubly linked list, leaving it detached.
    fn unlink(&mut self, h: SlotHandle) {
        let (list, prev, next) = {
            let slot = self.slot(h);
            (slot.list, slot.prev, slot.next)
        };
        if list == ListId::Detached {
            return;
        }
        debug_assert!(list == ListId::Active || list == ListId::Ready);

        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.list_ends(list).head = next,
        }
        match next {
            Some(n) => self.slot_mut(n).prev = prev,
            None => self.list_ends(list).tail = prev,
        }

        let slot = self.slot_mut(h);
        slot.prev = None;
        slot.next = None;
        slot.list = ListId::Detached;
        self.detached += 1;
    }

    fn push_tail(&mut self, h: SlotHandle, list: ListId) {
        debug_assert_eq!(self.slot(h).list, ListId::Detached);
        self.detached -= 1;

        let tail = self.list_ends(list).tail;
        match tail {
            Some(t) => self.slot_mut(t).next = Some(h),
            None => self.list_ends(list).head = Some(h),
        }
        self.list_ends(list).tail = Some(h);

        let slot = self.slot_mut(h);
        slot.prev = tail;
        slot.next = None;
        slot.list = list;
    }

    pub(crate) fn attach_active(&mut self, h: SlotHandle) {
        self.push_tail(h, ListId::Active);
    }

    /// Attach a detached slot to the active list; a slot already on a list
    /// stays where it is.
    pub(crate) fn ensure_active(&mut self, h: SlotHandle) {
        if self.slot(h).list == ListId::Detached {
            self.attach_active(h);
        }
    }

    /// Move a slot to the active tail after it was serviced, so equally
    /// eligible slots take turns under the scheduler's scan-from-head
    /// selection.
    pub(crate) fn rotate_active_to_tail(&mut self, h: SlotHandle) {
        if self.slot(h).list == ListId::Active {
            self.unlink(h);
            self.push_tail(h, ListId::Active);
        }
    }

    pub(crate) fn move_to_ready(&mut self, h: SlotHandle) {
        self.unlink(h);
        self.push_tail(h, ListId::Ready);
    }

    /// Detach a slot for the duration of a user callback; it is in no list
    /// while user code runs.
    pub(crate) fn detach(&mut self, h: SlotHandle) {
        self.unlink(h);
    }

    pub(crate) fn detached_count(&self) -> usize {
        self.detached
    }

    /// Pop from the callback-ready list, preferring high-priority slots.
    pub(crate) fn pop_ready(&mut self) -> Option<SlotHandle> {
        let mut cursor = self.ready.head;
        let mut fallback = None;
        while let Some(h) = cursor {
            if self.slot(h).niceness == Niceness::High {
                self.unlink(h);
                return Some(h);
            }
            fallback.get_or_insert(h);
            cursor = self.slot(h).next;
        }
        let h = fallback?;
        self.unlink(h);
        Some(h)
    }

    pub(crate) fn active_is_empty(&self) -> bool {
        self.active.head.is_none()
    }

    pub(crate) fn ready_is_empty(&self) -> bool {
        self.ready.head.is_none()
    }

    /// Handles of all active slots in list order. Collected up front so
    /// callers can mutate slots (and the lists) while iterating.
    pub(crate) fn active_handles(&self) -> Vec<SlotHandle> {
        self.collect_list(self.active.head)
    }

    pub(crate) fn ready_handles(&self) -> Vec<SlotHandle> {
        self.collect_list(self.ready.head)
    }

    /// Handles of every live slot, regardless of list.
    pub(crate) fn live_handles(&self) -> Vec<SlotHandle> {
        self.index.values().copied().collect()
    }

    fn collect_list(&self, head: Option<SlotHandle>) -> Vec<SlotHandle> {
        let mut handles = Vec::new();
        let mut cursor = head;
        while let Some(h) = cursor {
            handles.push(h);
            cursor = self.slot(h).next;
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn key(trans_id: u32, incoming: bool) -> SlotKey {
        SlotKey {
            trans_id,
            peer: SocketAddr::from(([10, 0, 0, 1], 8053)),
            incoming,
        }
    }

    #[test]
    fn test_allocate_free_accounting() {
        let mut table = SlotTable::new(3);
        assert_eq!(table.free_count(), 3);

        let a = table.allocate(key(1, false)).unwrap();
        let b = table.allocate(key(2, true)).unwrap();
        let c = table.allocate(key(3, false)).unwrap();
        assert_eq!(table.used_count(), 3);
        assert_eq!(table.used_incoming_count(), 1);
        assert_eq!(table.free_count(), 0);
        assert_eq!(table.used_count() + table.free_count(), 3);

        // pool exhausted
        assert_eq!(table.allocate(key(4, false)).unwrap_err(), TransportError::NoSlots);

        table.free(b);
        assert_eq!(table.used_incoming_count(), 0);
        let d = table.allocate(key(5, false)).unwrap();
        assert_eq!(d, b, "freed slot should be recycled");

        table.free(a);
        table.free(c);
        table.free(d);
        assert_eq!(table.used_count(), 0);
        assert_eq!(table.free_count(), 3);
        assert!(table.is_drained());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut table = SlotTable::new(2);
        table.allocate(key(1, false)).unwrap();
        assert!(matches!(table.allocate(key(1, false)), Err(TransportError::BadCall(_))));
        // same transaction id, other direction is a distinct key
        table.allocate(key(1, true)).unwrap();
    }

    #[test]
    fn test_lookup_follows_lifecycle() {
        let mut table = SlotTable::new(2);
        let k = key(9, false);
        assert_eq!(table.lookup(&k), None);

        let h = table.allocate(k).unwrap();
        assert_eq!(table.lookup(&k), Some(h));
        assert!(table.is_live(h, &k));

        table.free(h);
        assert_eq!(table.lookup(&k), None);
        assert!(!table.is_live(h, &k));
    }

    #[test]
    fn test_list_transitions() {
        let mut table = SlotTable::new(4);
        let a = table.allocate(key(1, false)).unwrap();
        let b = table.allocate(key(2, false)).unwrap();
        let c = table.allocate(key(3, false)).unwrap();

        assert_eq!(table.active_handles(), vec![a, b, c]);
        assert!(table.ready_is_empty());

        table.move_to_ready(b);
        assert_eq!(table.active_handles(), vec![a, c]);
        assert_eq!(table.ready_handles(), vec![b]);

        table.rotate_active_to_tail(a);
        assert_eq!(table.active_handles(), vec![c, a]);

        table.detach(c);
        assert_eq!(table.detached_count(), 1);
        assert_eq!(table.active_handles(), vec![a]);

        table.attach_active(c);
        assert_eq!(table.active_handles(), vec![a, c]);
        assert_eq!(table.detached_count(), 0);
    }

    #[test]
    fn test_pop_ready_prefers_high_priority() {
        let mut table = SlotTable::new(4);
        let a = table.allocate(key(1, false)).unwrap();
        let b = table.allocate(key(2, false)).unwrap();
        table.slot_mut(a).niceness = Niceness::Low;
        table.slot_mut(b).niceness = Niceness::High;

        table.move_to_ready(a);
        table.move_to_ready(b);

        assert_eq!(table.pop_ready(), Some(b));
        assert_eq!(table.pop_ready(), Some(a));
        assert_eq!(table.pop_ready(), None);
        // popped slots are left detached for the callback invocation
        assert_eq!(table.detached_count(), 2);
    }

    #[test]
    fn test_rekey() {
        let mut table = SlotTable::new(3);
        let old = key(1, false);
        let h = table.allocate(old).unwrap();

        let new = SlotKey { trans_id: 1, peer: SocketAddr::from(([10, 0, 0, 2], 8053)), incoming: false };
        assert!(table.rekey(h, new));
        assert_eq!(table.lookup(&old), None);
        assert_eq!(table.lookup(&new), Some(h));
        assert_eq!(table.slot(h).key, new);

        // a taken key refuses the rekey and leaves the index intact
        let other = table.allocate(old).unwrap();
        assert!(!table.rekey(other, new));
        assert_eq!(table.lookup(&new), Some(h));
        assert_eq!(table.lookup(&old), Some(other));
    }
}
