//! Lock-free slot-reservation queue for co-located domain messaging
//!
//! A bounded ring of fixed-size message slots with multi-producer
//! reservation and a single consumer. Producers claim a slot, fill it, and
//! validate it; the consumer reads full slots and empties them when done.
//! There are no locks on the index paths: slot ownership is carried entirely
//! by a per-slot atomic status word.
//!
//! ## Slot lifecycle
//!
//! ```text
//! writeable -> reserved -> full -> reading -> empty -> writeable
//!                 \-> empty (unreserve)
//! ```
//!
//! - At most one producer holds a slot in `reserved`/`full`.
//! - Only the consumer moves a slot to `reading`, and only the consumer
//!   reclaims `empty` slots back to `writeable`.
//! - `write_idx` advances only by producer compare-and-swap; `read_idx`
//!   advances only by the consumer.
//!
//! The distinction between `empty` and `writeable` is load-bearing: emptied
//! slots stay unwritable until the consumer reclaims them while advancing
//! `read_idx`, otherwise a reserving producer could push `write_idx` past
//! slots the consumer has not walked yet and `read_idx` would jump over
//! `write_idx`.
//!
//! A queue of capacity `n` accepts at most `n - 1` in-flight messages: a
//! reservation requires the slot after `write_idx` to be writeable, so one
//! slot is always sacrificed to keep the indices unambiguous. Size the queue
//! with one extra slot for the intended burst.

use std::sync::atomic::{ AtomicU32, Ordering };

use parking_lot::{ Mutex, MutexGuard };
use static_assertions::const_assert_eq;

use crate::error::{ Result, WeftError };

// Slot status is compare-and-swapped as a bare word
const_assert_eq!(std::mem::size_of::<SlotState>(), 4);

/// Status of one slot in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    /// Empty and claimable by a producer
    Writeable = 0,
    /// Claimed by a producer, not yet readable
    Reserved = 1,
    /// Validated by its producer, readable
    Full = 2,
    /// Being read by the consumer
    Reading = 3,
    /// Drained, waiting for the consumer to reclaim it
    Empty = 4,
}

impl SlotState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Writeable,
            1 => Self::Reserved,
            2 => Self::Full,
            3 => Self::Reading,
            4 => Self::Empty,
            _ => unreachable!("invalid slot state"),
        }
    }
}

struct Slot<T> {
    status: AtomicU32,
    payload: Mutex<T>,
}

/// Multi-producer single-consumer slot-reservation queue
///
/// `T` is the fixed-size content of one slot. The payload mutex is
/// uncontended under the slot protocol (only the state holder touches it);
/// it exists to keep payload access safe without threading `unsafe` through
/// the transport.
pub struct SlotQueue<T> {
    slots: Box<[Slot<T>]>,
    read_idx: AtomicU32,
    write_idx: AtomicU32,
}

impl<T: Default> SlotQueue<T> {
    /// Create a queue with `capacity` slots, all writeable
    ///
    /// A zero-capacity queue is constructible but every reserve/read on it
    /// fails structurally; this mirrors the contract where capacity is a
    /// deployment decision validated at use.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                status: AtomicU32::new(SlotState::Writeable as u32),
                payload: Mutex::new(T::default()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            read_idx: AtomicU32::new(0),
            write_idx: AtomicU32::new(0),
        }
    }

    /// Number of slots in the ring
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Reserve a slot for writing
    ///
    /// Thread safe among any number of producers. Returns the slot index, or
    /// `EAGAIN` when the ring is full or contended, or `ENOMEM` for a
    /// zero-capacity queue.
    pub fn reserve(&self) -> Result<u32> {
        let size = self.slots.len() as u32;
        if size == 0 {
            return Err(WeftError::QueueZeroCapacity);
        }
        if size == 1 {
            // Single-slot ring degenerates to a two-state toggle
            return match self.slots[0].status.compare_exchange(
                SlotState::Writeable as u32,
                SlotState::Reserved as u32,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => Ok(0),
                Err(_) => Err(WeftError::QueueContended),
            };
        }

        loop {
            let old_idx = self.write_idx.load(Ordering::Acquire);
            let next_idx = (old_idx + 1) % size;
            if self.slots[next_idx as usize].status.load(Ordering::Acquire)
                != SlotState::Writeable as u32
            {
                // The slot after write_idx is not reclaimed yet: ring full
                return Err(WeftError::QueueContended);
            }
            if self
                .write_idx
                .compare_exchange(old_idx, next_idx, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            // We hold a claim on old_idx, but write_idx could lap the ring
            // before we mark it, so the slot itself must also be won by CAS
            if self.slots[old_idx as usize]
                .status
                .compare_exchange(
                    SlotState::Writeable as u32,
                    SlotState::Reserved as u32,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Ok(old_idx);
            }
            // Someone else got the slot; no harm done, try again
        }
    }

    /// Give a reserved slot back without publishing it
    ///
    /// Legal only on a slot the caller successfully reserved.
    pub fn unreserve(&self, slot: u32) -> Result<()> {
        self.expect_state(slot, SlotState::Reserved)?;
        let target = if self.slots.len() == 1 {
            SlotState::Writeable
        } else {
            SlotState::Empty
        };
        // Propagates to the reader lazily; no ordering needed beyond the CAS
        self.transition(slot, SlotState::Reserved, target)
    }

    /// Publish a reserved slot, making it readable
    ///
    /// The release ordering here is the visibility boundary: everything the
    /// producer wrote into the slot payload happens-before the consumer's
    /// acquire in [`SlotQueue::read`].
    pub fn validate(&self, slot: u32) -> Result<()> {
        self.expect_state(slot, SlotState::Reserved)?;
        self.transition(slot, SlotState::Reserved, SlotState::Full)
    }

    /// Take the next full slot for reading
    ///
    /// Single consumer only. Scans from `read_idx` toward `write_idx`,
    /// reclaiming any leading run of emptied slots back to `writeable`, and
    /// takes the first full slot found. Returns `EAGAIN` when nothing is
    /// readable.
    pub fn read(&self) -> Result<u32> {
        let size = self.slots.len() as u32;
        if size == 0 {
            return Err(WeftError::QueueZeroCapacity);
        }
        if size == 1 {
            if self.slots[0].status.load(Ordering::Acquire) == SlotState::Full as u32 {
                self.slots[0]
                    .status
                    .store(SlotState::Reading as u32, Ordering::Relaxed);
                return Ok(0);
            }
            return Err(WeftError::QueueContended);
        }

        let first = self.read_idx.load(Ordering::Relaxed);
        // Snapshot of the write frontier; anything validated later is
        // caught on the next poll
        let last = self.write_idx.load(Ordering::Acquire);
        let steps = if last >= first {
            last - first + 1
        } else {
            size - first + last + 1
        };

        let mut cur = first;
        let mut all_empty = true;
        let mut first_writeable: Option<u32> = None;
        let mut last_writeable = 0u32;
        for _ in 0..steps {
            let status = self.slots[cur as usize].status.load(Ordering::Acquire);
            if status == SlotState::Full as u32 {
                // Only the consumer makes this transition; producers never
                // touch a full slot
                self.slots[cur as usize]
                    .status
                    .store(SlotState::Reading as u32, Ordering::Relaxed);
                debug_assert_eq!(self.read_idx.load(Ordering::Relaxed), first);
                if first_writeable.is_some() {
                    // Never park read_idx on a slot we just reclaimed; wait
                    // on the next real thing
                    self.read_idx
                        .store((last_writeable + 1) % size, Ordering::Release);
                }
                return Ok(cur);
            } else if all_empty && status == SlotState::Empty as u32 {
                // Reclamation is reader-only work
                self.slots[cur as usize]
                    .status
                    .store(SlotState::Writeable as u32, Ordering::Release);
                if first_writeable.is_none() {
                    first_writeable = Some(cur);
                }
                last_writeable = cur;
            } else {
                all_empty = false;
            }
            cur = (cur + 1) % size;
        }

        debug_assert_eq!(self.read_idx.load(Ordering::Relaxed), first);
        if first_writeable.is_some() {
            self.read_idx
                .store((last_writeable + 1) % size, Ordering::Release);
        }
        Err(WeftError::QueueContended)
    }

    /// Return a read slot to the ring
    ///
    /// Legal only on a slot obtained from [`SlotQueue::read`]. If the slot
    /// is at `read_idx` it goes straight back to `writeable` and `read_idx`
    /// advances by one (the next read advances further if needed); otherwise
    /// it parks in `empty` until the consumer reclaims it in order.
    pub fn empty(&self, slot: u32) -> Result<()> {
        self.expect_state(slot, SlotState::Reading)?;
        let size = self.slots.len() as u32;

        if size > 1 && slot == self.read_idx.load(Ordering::Relaxed) {
            self.slots[slot as usize]
                .status
                .store(SlotState::Writeable as u32, Ordering::Release);
            self.read_idx.store((slot + 1) % size, Ordering::Release);
        } else {
            let target = if size == 1 {
                SlotState::Writeable
            } else {
                SlotState::Empty
            };
            self.slots[slot as usize]
                .status
                .store(target as u32, Ordering::Release);
        }
        Ok(())
    }

    /// Access the payload of a slot the caller currently owns
    ///
    /// Owning means holding the slot in `reserved` (producer side) or
    /// `reading` (consumer side); the state machine makes the lock
    /// uncontended.
    pub fn payload(&self, slot: u32) -> MutexGuard<'_, T> {
        self.slots[slot as usize].payload.lock()
    }

    /// Current state of a slot (diagnostics and tests)
    pub fn slot_state(&self, slot: u32) -> SlotState {
        SlotState::from_u32(self.slots[slot as usize].status.load(Ordering::Acquire))
    }

    /// True when the ring is fully drained: indices meet and every slot is
    /// writeable
    pub fn is_drained(&self) -> bool {
        self.read_idx.load(Ordering::Acquire) == self.write_idx.load(Ordering::Acquire)
            && self
                .slots
                .iter()
                .all(|s| s.status.load(Ordering::Acquire) == SlotState::Writeable as u32)
    }

    fn expect_state(&self, slot: u32, expected: SlotState) -> Result<()> {
        if slot as usize >= self.slots.len() {
            return Err(WeftError::SlotNotOwned { slot: slot as usize });
        }
        if self.slots[slot as usize].status.load(Ordering::Acquire) != expected as u32 {
            return Err(WeftError::SlotNotOwned { slot: slot as usize });
        }
        Ok(())
    }

    fn transition(&self, slot: u32, from: SlotState, to: SlotState) -> Result<()> {
        self.slots[slot as usize]
            .status
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| WeftError::SlotNotOwned { slot: slot as usize })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_queue_all_writeable() {
        let q: SlotQueue<u64> = SlotQueue::new(4);
        assert_eq!(q.capacity(), 4);
        for i in 0..4 {
            assert_eq!(q.slot_state(i), SlotState::Writeable);
        }
        assert!(q.is_drained());
    }

    #[test]
    fn test_zero_capacity_is_structural() {
        let q: SlotQueue<u64> = SlotQueue::new(0);
        assert!(matches!(q.reserve(), Err(WeftError::QueueZeroCapacity)));
        assert!(matches!(q.read(), Err(WeftError::QueueZeroCapacity)));
    }

    #[test]
    fn test_reserve_validate_read_empty_cycle() {
        let q: SlotQueue<u64> = SlotQueue::new(4);
        let slot = q.reserve().unwrap();
        *q.payload(slot) = 99;
        assert_eq!(q.slot_state(slot), SlotState::Reserved);

        // Not yet readable
        assert!(q.read().is_err());
        q.validate(slot).unwrap();

        let rslot = q.read().unwrap();
        assert_eq!(rslot, slot);
        assert_eq!(*q.payload(rslot), 99);
        q.empty(rslot).unwrap();
        assert!(q.is_drained());
    }

    #[test]
    fn test_unreserve_releases_slot() {
        let q: SlotQueue<u64> = SlotQueue::new(4);
        let slot = q.reserve().unwrap();
        q.unreserve(slot).unwrap();
        // Nothing readable, and the ring still has room for a full burst
        assert!(q.read().is_err());
        for _ in 0..3 {
            let s = q.reserve().unwrap();
            q.validate(s).unwrap();
        }
    }

    #[test]
    fn test_ring_fills_at_capacity_minus_one() {
        let q: SlotQueue<u64> = SlotQueue::new(4);
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(q.reserve().unwrap());
        }
        // One slot is sacrificed to keep the indices unambiguous
        assert!(matches!(q.reserve(), Err(WeftError::QueueContended)));
        for s in held {
            q.validate(s).unwrap();
        }
        // Drain restores capacity
        for _ in 0..3 {
            let s = q.read().unwrap();
            q.empty(s).unwrap();
        }
        assert!(q.reserve().is_ok());
    }

    #[test]
    fn test_single_slot_toggle() {
        let q: SlotQueue<u64> = SlotQueue::new(1);
        let slot = q.reserve().unwrap();
        assert!(q.reserve().is_err());
        q.validate(slot).unwrap();
        let r = q.read().unwrap();
        assert_eq!(r, 0);
        q.empty(r).unwrap();
        assert_eq!(q.slot_state(0), SlotState::Writeable);
        assert!(q.reserve().is_ok());
    }

    #[test]
    fn test_wrong_state_operations_rejected() {
        let q: SlotQueue<u64> = SlotQueue::new(4);
        assert!(matches!(q.validate(0), Err(WeftError::SlotNotOwned { .. })));
        assert!(matches!(q.empty(1), Err(WeftError::SlotNotOwned { .. })));
        assert!(matches!(q.unreserve(2), Err(WeftError::SlotNotOwned { .. })));
        assert!(matches!(q.validate(17), Err(WeftError::SlotNotOwned { .. })));
    }

    #[test]
    fn test_out_of_order_empty_parks_until_reclaimed() {
        let q: SlotQueue<u64> = SlotQueue::new(8);
        let a = q.reserve().unwrap();
        let b = q.reserve().unwrap();
        q.validate(a).unwrap();
        q.validate(b).unwrap();

        let ra = q.read().unwrap();
        let rb = q.read().unwrap();
        // Empty the later slot first: it parks in Empty
        q.empty(rb).unwrap();
        assert_eq!(q.slot_state(rb), SlotState::Empty);
        q.empty(ra).unwrap();

        // Next read pass reclaims the parked slot
        assert!(q.read().is_err());
        assert!(q.is_drained());
    }

    #[test]
    fn test_multi_producer_single_consumer() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 256;

        let q: Arc<SlotQueue<u64>> = Arc::new(SlotQueue::new(8));
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        loop {
                            match q.reserve() {
                                Ok(slot) => {
                                    *q.payload(slot) = (p * PER_PRODUCER + i) as u64;
                                    q.validate(slot).unwrap();
                                    break;
                                }
                                Err(WeftError::QueueContended) => std::hint::spin_loop(),
                                Err(e) => panic!("reserve failed: {e}"),
                            }
                        }
                    }
                })
            })
            .collect();

        let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
        let mut count = 0;
        while count < PRODUCERS * PER_PRODUCER {
            match q.read() {
                Ok(slot) => {
                    let value = *q.payload(slot) as usize;
                    assert!(!seen[value], "message {value} duplicated");
                    seen[value] = true;
                    q.empty(slot).unwrap();
                    count += 1;
                }
                Err(WeftError::QueueContended) => std::hint::spin_loop(),
                Err(e) => panic!("read failed: {e}"),
            }
        }
        for p in producers {
            p.join().unwrap();
        }
        assert!(seen.iter().all(|&s| s), "message lost");
        assert!(q.read().is_err());
        assert!(q.is_drained());
    }
}
