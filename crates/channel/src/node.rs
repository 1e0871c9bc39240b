//! Cross-process synchronization object shared by one Sink and its Sources.
//!
//! The Node lives inside the channel segment and holds only atomics and
//! process-shared semaphores, so every attached process can operate on it
//! through a shared reference no matter where the segment is mapped.
//!
//! Per slot there is a pair of semaphores forming its read barrier:
//! - `ready`: posted by the Sink when it publishes, waited on by the Source
//! - `done`: posted by the Source when it finished reading, waited on by the Sink
//!
//! Bookkeeping (occupancy, generations, cycle masks) is mutated only under
//! `lock`, which is separate from `write_gate` so Sources can connect and
//! leave while a publish cycle is in flight.

use crate::errors::{ChannelError, Result};
use crate::semaphore::{SemaphoreGuard, SharedSemaphore};
use crate::utils::{current_pid, slot_indices};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Upper bound on channel capacity, the width of the occupancy bitset.
pub const MAX_SLOTS: usize = 64;

/// A granted slot: index plus the generation it was granted under.
///
/// The generation changes every time the index is granted again, so a handle
/// that was evicted can never act on behalf of the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLease {
    pub index: usize,
    pub generation: u32,
}

#[repr(C)]
struct SlotState {
    generation: AtomicU32,
    owner_pid: AtomicI32,
    interrupt: AtomicU32,
    ready: SharedSemaphore,
    done: SharedSemaphore,
}

/// Borrowed read barrier of one slot.
pub struct BarrierRef<'a> {
    index: usize,
    ready: &'a SharedSemaphore,
    done: &'a SharedSemaphore,
}

impl<'a> BarrierRef<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Sink → Source: new data published.
    pub fn ready(&self) -> &'a SharedSemaphore {
        self.ready
    }

    /// Source → Sink: read finished.
    pub fn done(&self) -> &'a SharedSemaphore {
        self.done
    }
}

/// Exclusive hold on the write gate. Dropping it ends the write section.
#[must_use = "the write gate is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    _gate: SemaphoreGuard<'a>,
}

impl WriteGuard<'_> {
    pub fn end(self) {}
}

/// Slots armed by one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishCycle {
    pub sequence: u64,
    pub armed: Vec<SlotLease>,
}

/// How an armed slot left the rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The Source signalled completion (or released its slot mid-cycle).
    Done,
    /// The slot changed hands before the Sink looked at it again.
    Departed,
    /// No completion within the timeout, slot was force-released.
    Evicted { pid: i32 },
    /// The Sink was asked to stop waiting.
    Interrupted,
}

/// Outcome of a Source waiting for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Published(u64),
    Interrupted,
    TimedOut,
}

#[repr(C)]
pub struct Node {
    capacity: AtomicU32,
    source_ref_count: AtomicU32,
    /// One past the highest index ever granted.
    high_water: AtomicU32,
    sink_interrupt: AtomicU32,
    /// Index + 1 of the slot the Sink is blocked on, 0 when not blocked.
    sink_waiting_on: AtomicU32,
    occupied: AtomicU64,
    /// Armed in the current cycle, completion not yet consumed by the Sink.
    inflight: AtomicU64,
    /// Armed in the current cycle, not yet acknowledged by the Source.
    pending: AtomicU64,
    sequence: AtomicU64,
    lock: SharedSemaphore,
    write_gate: SharedSemaphore,
    slots: [SlotState; MAX_SLOTS],
}

impl Node {
    /// Build the Node in zero-filled memory.
    ///
    /// # Safety
    ///
    /// The memory must be zeroed, must not be visible to any other handle
    /// yet, and must stay mapped while the Node is in use.
    pub unsafe fn init(&self, capacity: usize) -> Result<()> {
        if capacity == 0 || capacity > MAX_SLOTS {
            return Err(ChannelError::LayoutMismatch(format!(
                "capacity {} outside 1..={}",
                capacity, MAX_SLOTS
            )));
        }

        unsafe {
            self.lock.init(1)?;
            self.write_gate.init(1)?;
            for slot in &self.slots {
                slot.ready.init(0)?;
                slot.done.init(0)?;
            }
        }

        self.capacity.store(capacity as u32, Ordering::Release);
        Ok(())
    }

    /// # Safety
    ///
    /// No handle may use the Node afterwards.
    pub unsafe fn destroy(&self) -> Result<()> {
        unsafe {
            self.lock.destroy()?;
            self.write_gate.destroy()?;
            for slot in &self.slots {
                slot.ready.destroy()?;
                slot.done.destroy()?;
            }
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire) as usize
    }

    pub fn source_ref_count(&self) -> usize {
        self.source_ref_count.load(Ordering::Acquire) as usize
    }

    /// Occupancy bitset, bit `i` set when slot `i` is held.
    pub fn occupied(&self) -> u64 {
        self.occupied.load(Ordering::Acquire)
    }

    pub fn is_occupied(&self, index: usize) -> bool {
        index < MAX_SLOTS && self.occupied() & (1 << index) != 0
    }

    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Acquire) as usize
    }

    /// Number of publishes so far.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn owner_pid(&self, index: usize) -> Option<i32> {
        if !self.is_occupied(index) {
            return None;
        }
        Some(self.slots[index].owner_pid.load(Ordering::Acquire))
    }

    /// Whether the Sink is waiting for this slot to read the current publish.
    pub fn is_pending(&self, index: usize) -> bool {
        index < MAX_SLOTS && self.pending.load(Ordering::Acquire) & (1 << index) != 0
    }

    fn capacity_mask(&self) -> u64 {
        match self.capacity() {
            MAX_SLOTS => u64::MAX,
            capacity => (1u64 << capacity) - 1,
        }
    }

    fn invalid_index(&self, index: usize) -> ChannelError {
        ChannelError::InvalidIndex {
            index,
            capacity: self.capacity(),
        }
    }

    /// Whether `lease` still names the current occupant of its slot.
    pub(crate) fn holds(&self, lease: &SlotLease) -> bool {
        self.is_occupied(lease.index)
            && self.slots[lease.index].generation.load(Ordering::Acquire) == lease.generation
    }

    /// Grant the lowest free slot.
    ///
    /// Free slots whose last cycle is still being wound down by the Sink are
    /// only handed out when nothing else is free.
    pub fn acquire_slot(&self) -> Result<SlotLease> {
        let _table = self.lock.lock()?;

        let capacity = self.capacity();
        let count = self.source_ref_count();
        let free = !self.occupied() & self.capacity_mask();
        if count >= capacity || free == 0 {
            return Err(ChannelError::CapacityExceeded {
                channel: String::new(),
                capacity,
                occupied: count,
            });
        }

        let inflight = self.inflight.load(Ordering::Acquire);
        let settled = free & !inflight;
        let index = (if settled != 0 { settled } else { free }).trailing_zeros() as usize;
        let bit = 1u64 << index;
        let slot = &self.slots[index];

        // A wake left over from the previous occupant must not reach the new one
        slot.ready.drain()?;
        if inflight & bit == 0 {
            slot.done.drain()?;
        }

        slot.interrupt.store(0, Ordering::Release);
        slot.owner_pid.store(current_pid(), Ordering::Release);
        let generation = slot.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);

        self.occupied.fetch_or(bit, Ordering::AcqRel);
        self.source_ref_count.fetch_add(1, Ordering::AcqRel);
        self.high_water
            .fetch_max(index as u32 + 1, Ordering::AcqRel);

        Ok(SlotLease { index, generation })
    }

    /// Release a slot by index.
    ///
    /// Fails with `InvalidIndex` for an index that is out of range or not
    /// currently held; the count is never decremented in that case.
    pub fn release_slot(&self, index: usize) -> Result<()> {
        self.release(index, None)
    }

    /// Release a slot on behalf of its leaseholder.
    pub(crate) fn release_lease(&self, lease: &SlotLease) -> Result<()> {
        self.release(lease.index, Some(lease.generation))
    }

    fn release(&self, index: usize, generation: Option<u32>) -> Result<()> {
        if index >= self.capacity() {
            return Err(self.invalid_index(index));
        }

        let _table = self.lock.lock()?;

        if !self.is_occupied(index) {
            return Err(match generation {
                Some(_) => ChannelError::Evicted { index },
                None => self.invalid_index(index),
            });
        }
        if let Some(generation) = generation
            && self.slots[index].generation.load(Ordering::Acquire) != generation
        {
            return Err(ChannelError::Evicted { index });
        }

        self.vacate(index, true)
    }

    /// Clear a held slot. Caller holds `lock`.
    ///
    /// With `complete_pending`, an unacknowledged publish is completed on the
    /// Source's behalf so the Sink's rendezvous does not block on it.
    fn vacate(&self, index: usize, complete_pending: bool) -> Result<()> {
        let bit = 1u64 << index;
        let slot = &self.slots[index];

        self.occupied.fetch_and(!bit, Ordering::AcqRel);
        let previous = self.source_ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "occupied slot with zero ref count");
        slot.owner_pid.store(0, Ordering::Release);

        let was_pending = self.pending.fetch_and(!bit, Ordering::AcqRel) & bit != 0;
        if was_pending && complete_pending {
            slot.done.post()?;
        }
        Ok(())
    }

    /// Read barrier of a slot that has been granted at least once.
    pub fn read_barrier(&self, index: usize) -> Result<BarrierRef<'_>> {
        if index >= self.capacity() || index >= self.high_water() {
            return Err(self.invalid_index(index));
        }

        let slot = &self.slots[index];
        Ok(BarrierRef {
            index,
            ready: &slot.ready,
            done: &slot.done,
        })
    }

    pub fn begin_write(&self) -> Result<WriteGuard<'_>> {
        Ok(WriteGuard {
            _gate: self.write_gate.lock()?,
        })
    }

    pub fn begin_write_timeout(&self, timeout: Duration) -> Result<Option<WriteGuard<'_>>> {
        Ok(self
            .write_gate
            .lock_timeout(timeout)?
            .map(|gate| WriteGuard { _gate: gate }))
    }

    /// Publish step: release the read barrier of every occupied slot once.
    ///
    /// Slots granted after this returns are not part of the cycle.
    pub fn arm_readers(&self) -> Result<PublishCycle> {
        let _table = self.lock.lock()?;

        let mask = self.occupied();
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        self.inflight.fetch_or(mask, Ordering::AcqRel);
        self.pending.fetch_or(mask, Ordering::AcqRel);

        let mut armed = Vec::with_capacity(mask.count_ones() as usize);
        for index in slot_indices(mask) {
            let slot = &self.slots[index];
            armed.push(SlotLease {
                index,
                generation: slot.generation.load(Ordering::Acquire),
            });
            slot.ready.post()?;
        }

        Ok(PublishCycle { sequence, armed })
    }

    /// Rendezvous step for one armed slot: wait for its completion.
    ///
    /// On timeout the slot is evicted if it still belongs to the Source that
    /// was armed.
    pub fn await_completion(
        &self,
        lease: &SlotLease,
        timeout: Option<Duration>,
    ) -> Result<Completion> {
        let bit = 1u64 << lease.index;
        let slot = &self.slots[lease.index];

        // Publish what we wait on before checking the flag, the interrupter
        // does the opposite, so one of us always sees the other.
        self.sink_waiting_on
            .store(lease.index as u32 + 1, Ordering::SeqCst);
        let waited = if self.sink_interrupt.load(Ordering::SeqCst) != 0 {
            Ok(false)
        } else {
            slot.done.wait_for(timeout)
        };
        self.sink_waiting_on.store(0, Ordering::SeqCst);
        let signalled = waited?;

        if self.sink_interrupt.load(Ordering::SeqCst) != 0 {
            return Ok(Completion::Interrupted);
        }

        let _table = self.lock.lock()?;
        self.inflight.fetch_and(!bit, Ordering::AcqRel);

        if signalled {
            return Ok(Completion::Done);
        }

        // Acknowledged between the timeout and taking the lock
        if self.pending.load(Ordering::Acquire) & bit == 0 {
            slot.done.try_wait()?;
            return Ok(Completion::Done);
        }

        if self.holds(lease) {
            let pid = slot.owner_pid.load(Ordering::Acquire);
            self.vacate(lease.index, false)?;
            return Ok(Completion::Evicted { pid });
        }

        Ok(Completion::Departed)
    }

    /// Source side: wait until the Sink arms this slot.
    pub(crate) fn await_publish(
        &self,
        lease: &SlotLease,
        timeout: Option<Duration>,
    ) -> Result<Wakeup> {
        if !self.holds(lease) {
            return Err(ChannelError::Evicted { index: lease.index });
        }

        let slot = &self.slots[lease.index];
        let bit = 1u64 << lease.index;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if !slot.ready.wait_for(remaining)? {
                return Ok(Wakeup::TimedOut);
            }

            if slot.interrupt.swap(0, Ordering::AcqRel) != 0 {
                // Leave exactly one wake behind if a publish is still waiting on us
                let _table = self.lock.lock()?;
                slot.ready.drain()?;
                if self.holds(lease) && self.pending.load(Ordering::Acquire) & bit != 0 {
                    slot.ready.post()?;
                }
                return Ok(Wakeup::Interrupted);
            }

            if !self.holds(lease) {
                // Hand the wake on only if the new occupant is armed
                let _table = self.lock.lock()?;
                if self.is_occupied(lease.index) && self.pending.load(Ordering::Acquire) & bit != 0
                {
                    slot.ready.post()?;
                }
                return Err(ChannelError::Evicted { index: lease.index });
            }

            // Left over from a cycle this lease was never armed for
            if self.pending.load(Ordering::Acquire) & bit == 0 {
                continue;
            }

            return Ok(Wakeup::Published(self.sequence()));
        }
    }

    /// Source side: acknowledge the current publish.
    ///
    /// A no-op when the cycle was abandoned by the Sink in the meantime.
    pub fn signal_done(&self, lease: &SlotLease) -> Result<()> {
        let _table = self.lock.lock()?;

        if !self.holds(lease) {
            return Err(ChannelError::Evicted { index: lease.index });
        }

        let bit = 1u64 << lease.index;
        if self.pending.fetch_and(!bit, Ordering::AcqRel) & bit != 0 {
            self.slots[lease.index].done.post()?;
        }
        Ok(())
    }

    /// Abort the leaseholder's current or next wait.
    pub(crate) fn interrupt_source(&self, lease: &SlotLease) -> Result<()> {
        let _table = self.lock.lock()?;

        if self.holds(lease) {
            let slot = &self.slots[lease.index];
            slot.interrupt.store(1, Ordering::Release);
            slot.ready.post()?;
        }
        Ok(())
    }

    /// Abort the Sink's rendezvous wait. The Sink stays interrupted until a
    /// new Sink resets the Node.
    pub(crate) fn interrupt_sink(&self) -> Result<()> {
        self.sink_interrupt.store(1, Ordering::SeqCst);
        let waiting_on = self.sink_waiting_on.load(Ordering::SeqCst);
        if waiting_on != 0 {
            self.slots[waiting_on as usize - 1].done.post()?;
        }
        Ok(())
    }

    pub fn sink_interrupted(&self) -> bool {
        self.sink_interrupt.load(Ordering::SeqCst) != 0
    }

    /// Drop the state of a cycle abandoned by a previous Sink.
    pub(crate) fn reset_rendezvous(&self) -> Result<()> {
        let _table = self.lock.lock()?;

        let inflight = self.inflight.swap(0, Ordering::AcqRel);
        let pending = self.pending.swap(0, Ordering::AcqRel);
        for index in slot_indices(inflight) {
            self.slots[index].done.drain()?;
        }
        for index in slot_indices(pending) {
            self.slots[index].ready.drain()?;
        }

        self.sink_interrupt.store(0, Ordering::SeqCst);
        self.sink_waiting_on.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Reopen a write gate left closed by a Sink that died mid-cycle.
    ///
    /// Returns `true` if the gate had to be forced open.
    pub(crate) fn recover_write_gate(&self, timeout: Duration) -> Result<bool> {
        match self.begin_write_timeout(timeout)? {
            Some(_gate) => Ok(false),
            None => {
                self.write_gate.post()?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn heap_node(capacity: usize) -> Box<Node> {
    // Node is atomics and sem_t bytes, all-zero is its pre-init state
    let node: Box<Node> = Box::new(unsafe { std::mem::zeroed() });
    unsafe { node.init(capacity).unwrap() };
    node
}
