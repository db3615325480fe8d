//! Commit queue arena
//!
//! Preallocated slots linked by index. Two separate lists run through the
//! slots, each with its own link field:
//!
//! - the batch queue (`next_in_queue`), newest first
//! - per-slot dependents (`subsequent_head` / `next_subsequent`), newest
//!   first: commits declared to go right after this one
//!
//! Freezing takes the whole queue, restores arrival order and places every
//! dependent immediately after the commit it waits for.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Free,
    /// Ticket handed out; commit not started
    Registered,
    /// Parked on a prior commit that has not been frozen yet
    WaitingPrior,
    Queued,
    /// Part of a batch being written
    Frozen,
}

#[derive(Debug)]
struct Slot<M> {
    generation: u64,
    status: SlotStatus,
    next_in_queue: Option<usize>,
    subsequent_head: Option<usize>,
    next_subsequent: Option<usize>,
    waiting_on: Option<usize>,
    member: Option<M>,
}

impl<M> Slot<M> {
    fn new() -> Self {
        Self {
            generation: 0,
            status: SlotStatus::Free,
            next_in_queue: None,
            subsequent_head: None,
            next_subsequent: None,
            waiting_on: None,
            member: None,
        }
    }
}

#[derive(Debug)]
pub struct CommitArena<M> {
    slots: Vec<Slot<M>>,
    free: Vec<usize>,
    queue_head: Option<usize>,
    queue_len: usize,
}

impl<M> CommitArena<M> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::new);
        Self {
            slots,
            free: (0..capacity).rev().collect(),
            queue_head: None,
            queue_len: 0,
        }
    }

    /// Take a slot for a new commit; grows when the preallocation runs out
    pub fn alloc(&mut self) -> (usize, u64) {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot::new());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[idx];
        slot.status = SlotStatus::Registered;
        (idx, slot.generation)
    }

    /// Return a slot; outstanding handles to it become stale
    pub fn release(&mut self, idx: usize) -> Option<M> {
        let slot = &mut self.slots[idx];
        debug_assert!(slot.subsequent_head.is_none(), "released slot still has dependents");
        slot.generation += 1;
        slot.status = SlotStatus::Free;
        slot.next_in_queue = None;
        slot.next_subsequent = None;
        slot.waiting_on = None;
        self.free.push(idx);
        slot.member.take()
    }

    pub fn is_current(&self, idx: usize, generation: u64) -> bool {
        self.slots
            .get(idx)
            .is_some_and(|s| s.generation == generation && s.status != SlotStatus::Free)
    }

    pub fn status(&self, idx: usize) -> SlotStatus {
        self.slots[idx].status
    }

    pub fn set_status(&mut self, idx: usize, status: SlotStatus) {
        self.slots[idx].status = status;
    }

    pub fn set_member(&mut self, idx: usize, member: M) {
        self.slots[idx].member = Some(member);
    }

    pub fn member(&self, idx: usize) -> Option<&M> {
        self.slots[idx].member.as_ref()
    }

    pub fn take_member(&mut self, idx: usize) -> Option<M> {
        self.slots[idx].member.take()
    }

    pub fn queue_len(&self) -> usize {
        self.queue_len
    }

    /// Push onto the batch queue; true if the queue was empty, making the
    /// caller leader for the next batch
    pub fn enqueue(&mut self, idx: usize) -> bool {
        let was_empty = self.queue_head.is_none();
        let slot = &mut self.slots[idx];
        slot.status = SlotStatus::Queued;
        slot.next_in_queue = self.queue_head;
        self.queue_head = Some(idx);
        self.queue_len += 1;
        was_empty
    }

    /// Park `waiter` behind `waitee`
    pub fn subscribe(&mut self, waiter: usize, waitee: usize) {
        let head = self.slots[waitee].subsequent_head;
        let w = &mut self.slots[waiter];
        w.status = SlotStatus::WaitingPrior;
        w.waiting_on = Some(waitee);
        w.next_subsequent = head;
        self.slots[waitee].subsequent_head = Some(waiter);
    }

    /// Unlink a parked waiter; false if it was not parked
    pub fn unsubscribe(&mut self, waiter: usize) -> bool {
        let waitee = match self.slots[waiter].waiting_on {
            Some(w) if self.slots[waiter].status == SlotStatus::WaitingPrior => w,
            _ => return false,
        };
        let next = self.slots[waiter].next_subsequent.take();
        if self.slots[waitee].subsequent_head == Some(waiter) {
            self.slots[waitee].subsequent_head = next;
        } else {
            let mut cur = self.slots[waitee].subsequent_head;
            while let Some(i) = cur {
                if self.slots[i].next_subsequent == Some(waiter) {
                    self.slots[i].next_subsequent = next;
                    break;
                }
                cur = self.slots[i].next_subsequent;
            }
        }
        let w = &mut self.slots[waiter];
        w.waiting_on = None;
        w.status = SlotStatus::Registered;
        true
    }

    /// Detach `idx`'s dependents, oldest first
    pub fn take_subsequents(&mut self, idx: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.slots[idx].subsequent_head.take();
        while let Some(i) = cur {
            out.push(i);
            cur = self.slots[i].next_subsequent.take();
            self.slots[i].waiting_on = None;
        }
        out.reverse();
        out
    }

    /// Any queued commit has a dependent parked behind it
    pub fn queued_has_waiters(&self) -> bool {
        let mut cur = self.queue_head;
        while let Some(i) = cur {
            if self.slots[i].subsequent_head.is_some() {
                return true;
            }
            cur = self.slots[i].next_in_queue;
        }
        false
    }

    /// Take the whole queue as one batch in commit order
    pub fn freeze(&mut self) -> Vec<usize> {
        let mut arrivals = Vec::with_capacity(self.queue_len);
        let mut cur = self.queue_head.take();
        while let Some(i) = cur {
            arrivals.push(i);
            cur = self.slots[i].next_in_queue.take();
        }
        arrivals.reverse();
        self.queue_len = 0;

        let mut order = Vec::with_capacity(arrivals.len());
        for idx in arrivals {
            self.expand(idx, &mut order);
        }
        order
    }

    fn expand(&mut self, idx: usize, order: &mut Vec<usize>) {
        self.slots[idx].status = SlotStatus::Frozen;
        order.push(idx);
        for dep in self.take_subsequents(idx) {
            self.expand(dep, order);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> CommitArena<&'static str> {
        CommitArena::with_capacity(4)
    }

    #[test]
    fn test_first_enqueue_leads() {
        let mut a = arena();
        let (x, _) = a.alloc();
        let (y, _) = a.alloc();
        assert!(a.enqueue(x));
        assert!(!a.enqueue(y));
        assert_eq!(a.queue_len(), 2);
    }

    #[test]
    fn test_freeze_restores_arrival_order() {
        let mut a = arena();
        let ids: Vec<usize> = (0..3).map(|_| a.alloc().0).collect();
        for &i in &ids {
            a.enqueue(i);
        }
        assert_eq!(a.freeze(), ids);
        assert_eq!(a.queue_len(), 0);
        assert!(ids.iter().all(|&i| a.status(i) == SlotStatus::Frozen));
    }

    #[test]
    fn test_dependents_follow_their_waitee() {
        let mut a = arena();
        let (first, _) = a.alloc();
        let (other, _) = a.alloc();
        let (dep1, _) = a.alloc();
        let (dep2, _) = a.alloc();
        let (dep_of_dep, _) = a.alloc();

        a.subscribe(dep1, first);
        a.subscribe(dep2, first);
        a.subscribe(dep_of_dep, dep1);
        a.enqueue(first);
        a.enqueue(other);
        assert!(a.queued_has_waiters());

        assert_eq!(a.freeze(), vec![first, dep1, dep_of_dep, dep2, other]);
    }

    #[test]
    fn test_unsubscribe() {
        let mut a = arena();
        let (waitee, _) = a.alloc();
        let (w1, _) = a.alloc();
        let (w2, _) = a.alloc();
        a.subscribe(w1, waitee);
        a.subscribe(w2, waitee);
        assert!(a.unsubscribe(w1));
        assert!(!a.unsubscribe(w1));
        assert_eq!(a.status(w1), SlotStatus::Registered);
        assert_eq!(a.take_subsequents(waitee), vec![w2]);
    }

    #[test]
    fn test_release_bumps_generation() {
        let mut a = arena();
        let (idx, gen) = a.alloc();
        a.set_member(idx, "m");
        assert!(a.is_current(idx, gen));
        assert_eq!(a.release(idx), Some("m"));
        assert!(!a.is_current(idx, gen));
        let (again, gen2) = a.alloc();
        assert_eq!(again, idx);
        assert_eq!(gen2, gen + 1);
    }

    #[test]
    fn test_grows_past_capacity() {
        let mut a: CommitArena<()> = CommitArena::with_capacity(1);
        let (x, _) = a.alloc();
        let (y, _) = a.alloc();
        assert_ne!(x, y);
    }
}
