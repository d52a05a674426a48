//! Data-block engine: runtime-managed payload buffers
//!
//! A data block owns a payload buffer referenced by handle. Tasks acquire
//! blocks through their dependence slots under an access mode; the mode
//! system is the only lock user code gets over shared payloads. A block
//! becomes visible to other tasks after its creator releases it, and is
//! destroyed explicitly or, when created with the auto-destroy flag, at the
//! last release after the creator's.

use std::cell::UnsafeCell;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{ Result, WeftError };
use crate::event::Subscriber;
use crate::guid::Guid;

/// How a dependence slot may touch the underlying block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum AccessMode {
    /// Shared with other read-write acquirers; no isolation, callers order
    /// their own writes
    #[default]
    ReadWrite,
    /// Many concurrent readers, no mutation
    ReadOnly,
    /// Read-only, and the engine may refuse a later release back to writable
    Const,
    /// At most one exclusive-write task runs over the block at a time;
    /// ordering arbitrary but total
    ExclusiveWrite,
    /// Pure control edge: no payload is delivered
    Null,
}

impl AccessMode {
    /// Whether this mode allows writing through the delivered pointer
    pub fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite | Self::ExclusiveWrite)
    }
}

/// Creation flags for a data block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct DbFlags(u32);

impl DbFlags {
    /// Destroy at the last release once the creator has released
    pub const AUTO_DESTROY: DbFlags = DbFlags(0x1);
    /// Block may not be relocated (recorded; single-node runtimes never
    /// relocate)
    pub const PINNED: DbFlags = DbFlags(0x2);

    /// Combine flag sets
    pub fn with(self, other: DbFlags) -> DbFlags {
        DbFlags(self.0 | other.0)
    }

    /// Check whether every bit of `other` is set
    pub fn contains(self, other: DbFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Raw access to an acquired block's payload
///
/// Valid only between acquisition and release of the slot it was delivered
/// to. The access-mode protocol is what keeps concurrent holders sound:
/// writable pointers are handed out only under modes whose contract the
/// caller accepted.
#[derive(Debug, Clone, Copy)]
pub struct DbAccess {
    ptr: *mut u8,
    len: usize,
    writable: bool,
}

// SAFETY: the pointer targets a block allocation the dispatch glue pins for
// the whole acquisition, and mutation is governed by the access-mode
// contract above.
unsafe impl Send for DbAccess {}
unsafe impl Sync for DbAccess {}

impl DbAccess {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is zero-sized
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the payload
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: see the Send/Sync justification; lifetime is bounded by
        // the acquisition this access came from
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Write the payload; panics if the mode was not writable
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(self.writable, "block acquired read-only");
        // SAFETY: writable accesses are serialized (exclusive-write) or
        // explicitly unordered by contract (read-write)
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Store a little-endian u64 at byte offset `idx * 8`
    pub fn write_u64(&mut self, idx: usize, value: u64) {
        let bytes = value.to_le_bytes();
        self.as_mut_slice()[idx * 8..idx * 8 + 8].copy_from_slice(&bytes);
    }

    /// Load a little-endian u64 from byte offset `idx * 8`
    pub fn read_u64(&self, idx: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.as_slice()[idx * 8..idx * 8 + 8]);
        u64::from_le_bytes(bytes)
    }
}

/// Result of asking for an acquisition
#[derive(Debug)]
pub enum AcquireOutcome {
    /// Access granted
    Granted(DbAccess),
    /// The block is unreleased or an exclusive-write holder is active; the
    /// task must park and retry after a release
    MustWait,
}

/// Result of registering a dependence on the block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The block is released: deliver to the subscriber now
    Ready,
    /// Unreleased: the subscriber is queued and delivered at release
    Deferred,
}

/// What a release left behind
#[derive(Debug, Default)]
pub struct ReleaseOutcome {
    /// Parked tasks to hand back to the scheduler
    pub woken: Vec<Guid>,
    /// Subscribers queued before release, to be delivered now
    pub subscribers: Vec<Subscriber>,
    /// The block reached its auto-destroy condition
    pub destroy: bool,
}

struct DbState {
    /// Creator has published the block
    released: bool,
    /// Task currently holding exclusive-write, if any
    ew_holder: Option<Guid>,
    /// Tasks parked on the exclusive-write serialization or on an
    /// unreleased block
    waiters: Vec<Guid>,
    /// Current acquirer set
    acquirers: Vec<(Guid, AccessMode)>,
    /// Dependences registered before release
    pending_subscribers: Vec<Subscriber>,
}

/// A runtime-managed payload buffer
pub struct DataBlock {
    storage: Box<[UnsafeCell<u8>]>,
    flags: DbFlags,
    state: Mutex<DbState>,
}

// SAFETY: all shared mutation goes through DbAccess under the access-mode
// contract; the state mutex guards the bookkeeping.
unsafe impl Send for DataBlock {}
unsafe impl Sync for DataBlock {}

impl DataBlock {
    /// Allocate a zero-initialised block of `size` bytes
    pub fn new(size: usize, flags: DbFlags) -> Self {
        let storage = (0..size)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            storage,
            flags,
            state: Mutex::new(DbState {
                released: false,
                ew_holder: None,
                waiters: Vec::new(),
                acquirers: Vec::new(),
                pending_subscribers: Vec::new(),
            }),
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.storage.len()
    }

    /// Creation flags
    pub fn flags(&self) -> DbFlags {
        self.flags
    }

    /// Whether the block is pinned (non-relocatable)
    pub fn is_pinned(&self) -> bool {
        self.flags.contains(DbFlags::PINNED)
    }

    /// Whether the creator has released the block to other tasks
    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    fn access(&self, writable: bool) -> DbAccess {
        DbAccess {
            ptr: self.storage.as_ptr() as *mut u8,
            len: self.storage.len(),
            writable,
        }
    }

    /// The creator's initial write access, valid until its release
    pub fn creator_access(&self) -> DbAccess {
        self.access(true)
    }

    /// Record a dependence on this block
    ///
    /// An unreleased block defers the subscriber: delivery happens when the
    /// creator releases, never before, so a consumer cannot observe bytes
    /// the creator is still writing.
    pub fn subscribe(&self, sub: Subscriber) -> SubscribeOutcome {
        let mut state = self.state.lock();
        if state.released {
            SubscribeOutcome::Ready
        } else {
            trace!(consumer = ?sub.consumer, "block unreleased, deferring dependence");
            state.pending_subscribers.push(sub);
            SubscribeOutcome::Deferred
        }
    }

    /// Acquire for `task` under `mode`
    ///
    /// `Null` mode never reaches the engine (the slot is stripped upstream).
    /// An unreleased block parks the acquirer until the creator releases;
    /// exclusive-write acquisitions serialize against each other; everything
    /// else proceeds concurrently.
    pub fn acquire(&self, task: Guid, mode: AccessMode) -> Result<AcquireOutcome> {
        if mode == AccessMode::Null {
            return Err(WeftError::invalid_call("null-mode slots carry no block"));
        }
        let mut state = self.state.lock();
        if !state.released {
            if !state.waiters.contains(&task) {
                state.waiters.push(task);
            }
            trace!(?task, "block unreleased, parking task");
            return Ok(AcquireOutcome::MustWait);
        }
        if mode == AccessMode::ExclusiveWrite && state.ew_holder != Some(task) {
            if state.ew_holder.is_some() {
                if !state.waiters.contains(&task) {
                    state.waiters.push(task);
                }
                trace!(?task, "exclusive-write contended, parking task");
                return Ok(AcquireOutcome::MustWait);
            }
            state.ew_holder = Some(task);
        }
        state.acquirers.push((task, mode));
        Ok(AcquireOutcome::Granted(self.access(mode.is_writable())))
    }

    /// Creator's release: publish pending writes to future acquirers
    ///
    /// Wakes tasks parked on the unreleased block and hands back the
    /// subscribers whose delivery was deferred.
    pub fn release_from_creator(&self) -> ReleaseOutcome {
        let mut state = self.state.lock();
        state.released = true;
        let woken = std::mem::take(&mut state.waiters);
        let subscribers = std::mem::take(&mut state.pending_subscribers);
        let destroy = self.flags.contains(DbFlags::AUTO_DESTROY)
            && state.acquirers.is_empty()
            && woken.is_empty()
            && subscribers.is_empty();
        ReleaseOutcome {
            woken,
            subscribers,
            destroy,
        }
    }

    /// Release the acquisition `task` holds
    pub fn release(&self, task: Guid) -> Result<ReleaseOutcome> {
        let mut state = self.state.lock();
        let idx = state
            .acquirers
            .iter()
            .position(|(t, _)| *t == task)
            .ok_or_else(|| WeftError::invalid_call("release without acquisition"))?;
        state.acquirers.swap_remove(idx);
        let mut outcome = ReleaseOutcome::default();
        if state.ew_holder == Some(task) {
            state.ew_holder = None;
            outcome.woken = std::mem::take(&mut state.waiters);
        }
        outcome.destroy = self.flags.contains(DbFlags::AUTO_DESTROY)
            && state.released
            && state.acquirers.is_empty()
            && state.waiters.is_empty();
        Ok(outcome)
    }

    /// Number of current acquisitions (diagnostics)
    pub fn acquirer_count(&self) -> usize {
        self.state.lock().acquirers.len()
    }
}
