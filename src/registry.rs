//! Handle registry mapping guids to live runtime objects
//!
//! The registry is the single authority on object lifecycle: a handle is
//! issued exactly once, resolves only between the end of `create` and the
//! beginning of `destroy`, and the reserved guid values are never issued.
//! Both sides of every cross-object reference (event subscriber lists, task
//! output-event back-pointers) are stored as guids resolved through this
//! registry, so deleting one side never dangles the other.

use std::collections::HashMap;
use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::Arc;

use parking_lot::RwLock;

use crate::constants::REGISTRY_SHARDS;
use crate::datablock::DataBlock;
use crate::error::{ Result, WeftError };
use crate::event::Event;
use crate::guid::{ Guid, GuidKind, ERROR_GUID };
use crate::task::{ Task, TaskTemplate };

/// A live object the registry can hand back
#[derive(Clone)]
pub enum RuntimeObject {
    /// An event-driven task
    Task(Arc<Task>),
    /// A synchronizer event
    Event(Arc<Event>),
    /// A payload data block
    DataBlock(Arc<DataBlock>),
    /// A reusable task template
    Template(Arc<TaskTemplate>),
}

impl RuntimeObject {
    /// The kind tag for this object
    pub fn kind(&self) -> GuidKind {
        match self {
            Self::Task(_) => GuidKind::Task,
            Self::Event(_) => GuidKind::Event,
            Self::DataBlock(_) => GuidKind::DataBlock,
            Self::Template(_) => GuidKind::Template,
        }
    }
}

/// Process-wide handle registry
///
/// Sharded to keep issue/resolve contention off the hot dispatch path. The
/// registry is owned by the runtime context and torn down with it; it is
/// never an ambient global, so multiple runtimes can coexist in-process.
pub struct GuidRegistry {
    next: AtomicU64,
    shards: Box<[RwLock<HashMap<Guid, RuntimeObject>>]>,
}

impl GuidRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let shards = (0..REGISTRY_SHARDS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            // 0 is NULL_GUID and must never be issued
            next: AtomicU64::new(1),
            shards,
        }
    }

    fn shard(&self, guid: Guid) -> &RwLock<HashMap<Guid, RuntimeObject>> {
        let idx = (guid.as_raw() as usize) & (REGISTRY_SHARDS - 1);
        &self.shards[idx]
    }

    /// Issue a fresh handle for `object`
    ///
    /// Fails with a structural error if the 64-bit handle space is exhausted
    /// (the id counter would collide with the reserved top values).
    pub fn issue(&self, object: RuntimeObject) -> Result<Guid> {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        if raw >= ERROR_GUID.as_raw() {
            return Err(WeftError::config("guid space exhausted"));
        }
        let guid = Guid::from_raw(raw);
        let prev = self.shard(guid).write().insert(guid, object);
        debug_assert!(prev.is_none(), "guid issued twice");
        Ok(guid)
    }

    /// Resolve a handle to its live object
    ///
    /// A reserved or destroyed handle does not resolve; callers treat that
    /// as a programming bug unless they are specifically prepared for it.
    pub fn resolve(&self, guid: Guid) -> Result<RuntimeObject> {
        if guid.is_reserved() {
            return Err(WeftError::unresolved(guid, "reserved handle"));
        }
        self.shard(guid)
            .read()
            .get(&guid)
            .cloned()
            .ok_or_else(|| WeftError::unresolved(guid, "destroyed or never issued"))
    }

    /// Resolve a handle expected to be a task
    pub fn resolve_task(&self, guid: Guid) -> Result<Arc<Task>> {
        match self.resolve(guid)? {
            RuntimeObject::Task(t) => Ok(t),
            other => Err(WeftError::GuidKindMismatch {
                guid,
                actual: other.kind().name(),
                expected: GuidKind::Task.name(),
            }),
        }
    }

    /// Resolve a handle expected to be an event
    pub fn resolve_event(&self, guid: Guid) -> Result<Arc<Event>> {
        match self.resolve(guid)? {
            RuntimeObject::Event(e) => Ok(e),
            other => Err(WeftError::GuidKindMismatch {
                guid,
                actual: other.kind().name(),
                expected: GuidKind::Event.name(),
            }),
        }
    }

    /// Resolve a handle expected to be a data block
    pub fn resolve_data_block(&self, guid: Guid) -> Result<Arc<DataBlock>> {
        match self.resolve(guid)? {
            RuntimeObject::DataBlock(db) => Ok(db),
            other => Err(WeftError::GuidKindMismatch {
                guid,
                actual: other.kind().name(),
                expected: GuidKind::DataBlock.name(),
            }),
        }
    }

    /// Resolve a handle expected to be a template
    pub fn resolve_template(&self, guid: Guid) -> Result<Arc<TaskTemplate>> {
        match self.resolve(guid)? {
            RuntimeObject::Template(t) => Ok(t),
            other => Err(WeftError::GuidKindMismatch {
                guid,
                actual: other.kind().name(),
                expected: GuidKind::Template.name(),
            }),
        }
    }

    /// The kind of a live handle, if it resolves
    pub fn kind_of(&self, guid: Guid) -> Option<GuidKind> {
        self.resolve(guid).ok().map(|o| o.kind())
    }

    /// Retire a handle, removing it from the registry
    ///
    /// Subsequent resolutions fail. Returns the object so the caller can run
    /// its teardown while no longer reachable by handle.
    pub fn retire(&self, guid: Guid) -> Result<RuntimeObject> {
        if guid.is_reserved() {
            return Err(WeftError::unresolved(guid, "reserved handle"));
        }
        self.shard(guid)
            .write()
            .remove(&guid)
            .ok_or_else(|| WeftError::unresolved(guid, "destroyed or never issued"))
    }

    /// Number of live handles across all shards
    pub fn live_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}

impl Default for GuidRegistry {
    fn default() -> Self {
        Self::new()
    }
}
