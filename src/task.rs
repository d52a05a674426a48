//! Task engine: once-executing units gated by dependence slots
//!
//! A task is created from a template fixing its parameter and dependence
//! arity. Parameters are frozen at creation; each dependence slot is bound
//! exactly once and satisfied exactly once, and the task dispatches exactly
//! once when its frontier (the count of unsatisfied slots) reaches zero.
//!
//! A task marked *finish* carries an atomic scope counter: every task
//! spawned transitively inside it increments the counter and every
//! completion decrements it; the finish task's output event fires when the
//! counter returns to zero, not when the finish task itself returns.

use std::sync::atomic::{ AtomicBool, AtomicI64, AtomicU32, Ordering };

use parking_lot::Mutex;

use crate::datablock::{ AccessMode, DbAccess };
use crate::domain::TaskScope;
use crate::error::{ Result, WeftError };
use crate::guid::{ Guid, NULL_GUID, UNINITIALIZED_GUID };

/// User function a template names
///
/// `params` are the frozen creation-time words; `inputs` expose each
/// dependence slot's payload handle (and data pointer for acquired blocks)
/// in slot order. The returned handle is published to the task's output
/// event.
pub type TaskFn = fn(&TaskScope<'_>, params: &[u64], inputs: &[TaskInput]) -> Guid;

/// Creation properties for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskProps(u32);

impl TaskProps {
    /// The task opens a finish scope
    pub const FINISH: TaskProps = TaskProps(0x1);

    /// Combine property sets
    pub fn with(self, other: TaskProps) -> TaskProps {
        TaskProps(self.0 | other.0)
    }

    /// Check whether every bit of `other` is set
    pub fn contains(self, other: TaskProps) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// A resolved dependence handed to the user function
#[derive(Debug, Clone, Copy)]
pub struct TaskInput {
    /// The payload handle delivered to the slot (`NULL_GUID` for control
    /// edges and null-mode slots)
    pub handle: Guid,
    /// Access mode the slot was bound with
    pub mode: AccessMode,
    /// Payload pointer, present only when the handle is an acquired data
    /// block and the mode delivers data
    pub data: Option<DbAccess>,
}

/// A reusable declaration of `{function, param count, dep count}`
///
/// Reference-counted by task creation: destruction is deferred until the
/// last live task created from the template completes.
pub struct TaskTemplate {
    func: TaskFn,
    paramc: usize,
    depc: usize,
    live_tasks: AtomicU32,
    destroy_requested: AtomicBool,
}

impl TaskTemplate {
    /// Declare a template
    pub fn new(func: TaskFn, paramc: usize, depc: usize) -> Self {
        Self {
            func,
            paramc,
            depc,
            live_tasks: AtomicU32::new(0),
            destroy_requested: AtomicBool::new(false),
        }
    }

    /// The declared function
    pub fn func(&self) -> TaskFn {
        self.func
    }

    /// Declared parameter count
    pub fn paramc(&self) -> usize {
        self.paramc
    }

    /// Declared dependence count
    pub fn depc(&self) -> usize {
        self.depc
    }

    /// Account a task created from this template
    pub fn register_task(&self) {
        self.live_tasks.fetch_add(1, Ordering::AcqRel);
    }

    /// Account a task completing or being destroyed; true when a deferred
    /// template destruction can now be reclaimed
    pub fn task_done(&self) -> bool {
        let remaining = self.live_tasks.fetch_sub(1, Ordering::AcqRel) - 1;
        remaining == 0 && self.destroy_requested.load(Ordering::Acquire)
    }

    /// Request destruction; true when the template can be reclaimed now
    pub fn request_destroy(&self) -> bool {
        self.destroy_requested.store(true, Ordering::Release);
        self.live_tasks.load(Ordering::Acquire) == 0
    }

    /// Live tasks created from this template (diagnostics)
    pub fn live_tasks(&self) -> u32 {
        self.live_tasks.load(Ordering::Acquire)
    }
}

/// One dependence slot
#[derive(Debug, Clone, Copy)]
pub struct DepSlot {
    /// The bound producer (`UNINITIALIZED_GUID` until add-dependence)
    pub producer: Guid,
    /// Access mode of the binding
    pub mode: AccessMode,
    /// Delivered payload (meaningful once satisfied)
    pub payload: Guid,
    /// Whether the slot has been satisfied
    pub satisfied: bool,
}

impl Default for DepSlot {
    fn default() -> Self {
        Self {
            producer: UNINITIALIZED_GUID,
            mode: AccessMode::default(),
            payload: UNINITIALIZED_GUID,
            satisfied: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum TaskState {
    Created = 0,
    Ready = 1,
    Dispatched = 2,
    Destroyed = 3,
}

/// What a slot satisfaction did to the task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotProgress {
    /// Frontier decremented, task still waiting
    Waiting,
    /// Frontier reached zero: enqueue for dispatch
    Ready,
    /// Task was destroyed; the satisfaction is a no-op
    Gone,
}

/// An event-driven task
#[derive(Debug)]
pub struct Task {
    template: Guid,
    func: TaskFn,
    params: Box<[u64]>,
    slots: Mutex<Box<[DepSlot]>>,
    frontier: AtomicU32,
    state: AtomicU32,
    output_event: Guid,
    /// Nearest enclosing finish task (`NULL_GUID` when unscoped)
    finish_scope: Guid,
    is_finish: bool,
    /// Open-scope counter when this task is a finish task: itself plus
    /// every live descendant
    scope_children: AtomicI64,
    /// Return handle, published at scope completion for finish tasks
    finish_result: Mutex<Guid>,
}

impl Task {
    /// Create a task over `depc` unbound slots
    pub fn new(
        template: Guid,
        func: TaskFn,
        params: Box<[u64]>,
        depc: usize,
        output_event: Guid,
        finish_scope: Guid,
        is_finish: bool,
    ) -> Self {
        let slots = vec![DepSlot::default(); depc].into_boxed_slice();
        Self {
            template,
            func,
            params,
            slots: Mutex::new(slots),
            frontier: AtomicU32::new(depc as u32),
            state: AtomicU32::new(TaskState::Created as u32),
            output_event,
            finish_scope,
            is_finish,
            scope_children: AtomicI64::new(if is_finish { 1 } else { 0 }),
            finish_result: Mutex::new(NULL_GUID),
        }
    }

    /// The template this task was created from
    pub fn template(&self) -> Guid {
        self.template
    }

    /// The user function
    pub fn func(&self) -> TaskFn {
        self.func
    }

    /// Frozen parameters
    pub fn params(&self) -> &[u64] {
        &self.params
    }

    /// Dependence arity
    pub fn depc(&self) -> usize {
        self.slots.lock().len()
    }

    /// Reserved output event (`NULL_GUID` when none)
    pub fn output_event(&self) -> Guid {
        self.output_event
    }

    /// Nearest enclosing finish task
    pub fn finish_scope(&self) -> Guid {
        self.finish_scope
    }

    /// Whether this task opens a finish scope
    pub fn is_finish(&self) -> bool {
        self.is_finish
    }

    /// Remaining unsatisfied slots
    pub fn frontier(&self) -> u32 {
        self.frontier.load(Ordering::Acquire)
    }

    fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            0 => TaskState::Created,
            1 => TaskState::Ready,
            2 => TaskState::Dispatched,
            _ => TaskState::Destroyed,
        }
    }

    /// Bind `producer` into `slot`; slots are filled exactly once
    pub fn bind_slot(&self, slot: u32, producer: Guid, mode: AccessMode) -> Result<()> {
        let mut slots = self.slots.lock();
        let entry = slots
            .get_mut(slot as usize)
            .ok_or_else(|| WeftError::invalid_call(format!("slot {slot} out of range")))?;
        if self.state() == TaskState::Destroyed {
            return Err(WeftError::invalid_call("task destroyed"));
        }
        if !entry.producer.is_uninitialized() {
            return Err(WeftError::invalid_call(format!("slot {slot} already bound")));
        }
        entry.producer = producer;
        entry.mode = mode;
        Ok(())
    }

    /// Deliver `payload` into `slot`
    ///
    /// Races cleanly with pre-dispatch destruction: a satisfaction landing
    /// on a destroyed task is a no-op.
    pub fn satisfy_slot(&self, slot: u32, payload: Guid) -> Result<SlotProgress> {
        let mut slots = self.slots.lock();
        if self.state() == TaskState::Destroyed {
            return Ok(SlotProgress::Gone);
        }
        let entry = slots
            .get_mut(slot as usize)
            .ok_or_else(|| WeftError::invalid_call(format!("slot {slot} out of range")))?;
        if entry.satisfied {
            return Err(WeftError::invalid_call(format!(
                "slot {slot} satisfied twice"
            )));
        }
        entry.satisfied = true;
        entry.payload = payload;
        drop(slots);

        let before = self.frontier.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "frontier underflow");
        if before == 1 {
            // The zero transition claims readiness exactly once
            if self
                .state
                .compare_exchange(
                    TaskState::Created as u32,
                    TaskState::Ready as u32,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(SlotProgress::Ready);
            }
            return Ok(SlotProgress::Gone);
        }
        Ok(SlotProgress::Waiting)
    }

    /// Move a task with no dependence slots straight to ready
    pub fn ready_if_no_deps(&self) -> bool {
        self.frontier.load(Ordering::Acquire) == 0
            && self
                .state
                .compare_exchange(
                    TaskState::Created as u32,
                    TaskState::Ready as u32,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
    }

    /// Claim the task for execution; fails if it was already claimed
    pub fn take_for_dispatch(&self) -> Result<()> {
        self.state
            .compare_exchange(
                TaskState::Ready as u32,
                TaskState::Dispatched as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| WeftError::invalid_call("task not ready for dispatch"))
    }

    /// Snapshot the slots for payload resolution, in slot order
    pub fn snapshot_slots(&self) -> Vec<DepSlot> {
        self.slots.lock().to_vec()
    }

    /// Destroy before dispatch
    ///
    /// Returns the bound-but-unsatisfied event producers so the caller can
    /// unsubscribe them. Rejected once the frontier has reached zero:
    /// dispatch is then inevitable.
    pub fn destroy_pre_dispatch(&self, guid: Guid) -> Result<Vec<(Guid, u32)>> {
        let slots = self.slots.lock();
        if self
            .state
            .compare_exchange(
                TaskState::Created as u32,
                TaskState::Destroyed as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(WeftError::TaskAlreadyDispatched { guid });
        }
        let bound = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.producer.is_uninitialized() && !s.satisfied)
            .map(|(i, s)| (s.producer, i as u32))
            .collect();
        Ok(bound)
    }

    /// Record a task spawned inside this finish scope
    pub fn scope_enter(&self) {
        debug_assert!(self.is_finish);
        self.scope_children.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a completion inside this finish scope; true when the scope is
    /// now closed
    pub fn scope_exit(&self) -> bool {
        debug_assert!(self.is_finish);
        self.scope_children.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Store the finish task's own return handle for publication at scope
    /// close
    pub fn set_finish_result(&self, result: Guid) {
        *self.finish_result.lock() = result;
    }

    /// The stored finish result
    pub fn finish_result(&self) -> Guid {
        *self.finish_result.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_scope: &TaskScope<'_>, _params: &[u64], _inputs: &[TaskInput]) -> Guid {
        NULL_GUID
    }

    fn g(n: u64) -> Guid {
        Guid::from_raw(n)
    }

    fn task_with_deps(depc: usize) -> Task {
        Task::new(
            g(1),
            nop,
            Box::new([]),
            depc,
            NULL_GUID,
            NULL_GUID,
            false,
        )
    }

    #[test]
    fn test_frontier_counts_down_to_ready() {
        let t = task_with_deps(3);
        assert_eq!(t.frontier(), 3);
        for slot in 0..3u32 {
            t.bind_slot(slot, g(10 + slot as u64), AccessMode::ReadOnly)
                .unwrap();
        }
        assert_eq!(t.satisfy_slot(0, g(20)).unwrap(), SlotProgress::Waiting);
        assert_eq!(t.satisfy_slot(2, g(22)).unwrap(), SlotProgress::Waiting);
        assert_eq!(t.satisfy_slot(1, g(21)).unwrap(), SlotProgress::Ready);

        let slots = t.snapshot_slots();
        assert_eq!(slots[0].payload, g(20));
        assert_eq!(slots[1].payload, g(21));
        assert_eq!(slots[2].payload, g(22));
    }

    #[test]
    fn test_slot_bound_exactly_once() {
        let t = task_with_deps(1);
        t.bind_slot(0, g(5), AccessMode::ReadWrite).unwrap();
        assert!(t.bind_slot(0, g(6), AccessMode::ReadWrite).is_err());
        assert!(t.bind_slot(4, g(6), AccessMode::ReadWrite).is_err());
    }

    #[test]
    fn test_slot_satisfied_exactly_once() {
        let t = task_with_deps(2);
        t.satisfy_slot(0, g(1)).unwrap();
        assert!(t.satisfy_slot(0, g(2)).is_err());
    }

    #[test]
    fn test_dispatch_claimed_exactly_once() {
        let t = task_with_deps(1);
        assert_eq!(t.satisfy_slot(0, g(1)).unwrap(), SlotProgress::Ready);
        t.take_for_dispatch().unwrap();
        assert!(t.take_for_dispatch().is_err());
    }

    #[test]
    fn test_zero_dep_task_ready_at_creation() {
        let t = task_with_deps(0);
        assert_eq!(t.frontier(), 0);
        assert!(t.ready_if_no_deps());
        assert!(!t.ready_if_no_deps());
        t.take_for_dispatch().unwrap();
    }

    #[test]
    fn test_destroy_before_dispatch_returns_bound_producers() {
        let t = task_with_deps(3);
        t.bind_slot(0, g(10), AccessMode::ReadOnly).unwrap();
        t.bind_slot(2, g(12), AccessMode::ReadOnly).unwrap();
        t.satisfy_slot(2, g(99)).unwrap();

        let bound = t.destroy_pre_dispatch(g(7)).unwrap();
        // Only the bound-and-unsatisfied slot needs unsubscribing
        assert_eq!(bound, vec![(g(10), 0)]);
        // Late satisfactions are no-ops
        assert_eq!(t.satisfy_slot(1, g(1)).unwrap(), SlotProgress::Gone);
    }

    #[test]
    fn test_destroy_after_ready_rejected() {
        let t = task_with_deps(1);
        t.satisfy_slot(0, g(1)).unwrap();
        assert!(matches!(
            t.destroy_pre_dispatch(g(7)),
            Err(WeftError::TaskAlreadyDispatched { .. })
        ));
    }

    #[test]
    fn test_finish_scope_counter() {
        let f = Task::new(g(1), nop, Box::new([]), 0, NULL_GUID, NULL_GUID, true);
        // The finish task itself holds the scope open
        f.scope_enter(); // child 1
        f.scope_enter(); // child 2
        assert!(!f.scope_exit()); // child 1 done
        assert!(!f.scope_exit()); // child 2 done
        assert!(f.scope_exit()); // finish task done, scope closes
    }

    #[test]
    fn test_template_refcount_defers_destroy() {
        let tpl = TaskTemplate::new(nop, 2, 3);
        assert_eq!(tpl.paramc(), 2);
        assert_eq!(tpl.depc(), 3);

        tpl.register_task();
        tpl.register_task();
        // Destroy requested while tasks are live: deferred
        assert!(!tpl.request_destroy());
        assert!(!tpl.task_done());
        // Last task out reclaims
        assert!(tpl.task_done());
    }

    #[test]
    fn test_template_destroy_with_no_tasks_is_immediate() {
        let tpl = TaskTemplate::new(nop, 0, 0);
        assert!(tpl.request_destroy());
    }
}
