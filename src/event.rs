//! Event engine: synchronizers gating task execution
//!
//! An event records subscribers (tasks or other events, each with a slot and
//! access mode) and, once satisfied, delivers its carried payload handle to
//! all of them. Variants differ in when they fire, what a second
//! satisfaction means, and when the event destroys itself:
//!
//! - `once` fires at most once, auto-destroys after propagation, and rejects
//!   late subscribers.
//! - `sticky` fires at most once and persists; late subscribers are served
//!   immediately; a second satisfaction is a caller bug.
//! - `idempotent` is sticky except redundant satisfactions are silently
//!   ignored.
//! - `latch` carries a signed counter with an increment slot and a decrement
//!   slot; it fires like a once event when the counter returns to zero after
//!   going positive.
//! - `counted` declares its subscriber population up front and auto-destroys
//!   once it is satisfied and the last declared subscriber is bound.
//!
//! The engine never touches payload data: delivery hands over a handle and
//! the slot's access mode tags what the receiver may do with it. Satisfy
//! detaches the subscriber list under the state lock and the caller walks it
//! outside; subscribers arriving during the walk observe the satisfied state
//! and are served immediately.

use parking_lot::Mutex;
use tracing::trace;

use crate::datablock::AccessMode;
use crate::error::{ Result, WeftError };
use crate::guid::{ Guid, NULL_GUID };

/// Slot addressing a latch event's increment input
pub const LATCH_INCR_SLOT: u32 = 0;
/// Slot addressing a latch event's decrement input
pub const LATCH_DECR_SLOT: u32 = 1;

/// The event variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EventKind {
    /// Satisfied at most once, auto-destroyed after propagation
    Once,
    /// Satisfied at most once, persists, late subscribers served
    Sticky,
    /// Sticky, but redundant satisfactions are ignored
    Idempotent,
    /// Signed counter; fires on the return to zero from positive
    Latch,
    /// Declared subscriber count; auto-destroys when satisfied and fully
    /// subscribed
    Counted,
}

/// Variant-specific creation parameters
#[derive(Debug, Clone, Copy, Default)]
pub struct EventParams {
    /// Declared subscriber population (`counted` only)
    pub expected_subscribers: u32,
    /// Starting counter value (`latch` only; 0 starts disarmed)
    pub initial_count: i64,
    /// Tear the event down after its first propagation even for variants
    /// that would otherwise persist (`sticky`/`idempotent`)
    pub auto_destroy: bool,
}

/// One entry in an event's subscriber list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscriber {
    /// The dependent task or event
    pub consumer: Guid,
    /// Dependence slot on the consumer
    pub slot: u32,
    /// Access mode the payload is tagged with on delivery
    pub mode: AccessMode,
}

/// What a bind did
#[derive(Debug)]
pub enum BindOutcome {
    /// Recorded; delivery happens at satisfaction
    Recorded,
    /// Producer already satisfied: deliver now. `destroy` is set when this
    /// bind was a counted event's last declared subscriber.
    Immediate {
        /// Payload to deliver (before mode translation)
        payload: Guid,
        /// Event reached its auto-destruction condition
        destroy: bool,
    },
}

/// What a satisfaction did
#[derive(Debug)]
pub enum SatisfyOutcome {
    /// Counter moved but the event did not fire (latch)
    Pending,
    /// Redundant satisfaction silently ignored (idempotent)
    Ignored,
    /// The event fired: walk `subscribers` and deliver `payload`
    Fired {
        /// The carried payload handle
        payload: Guid,
        /// Subscriber list detached under the lock
        subscribers: Vec<Subscriber>,
        /// Event reached its auto-destruction condition
        destroy: bool,
    },
}

struct EventCore {
    satisfied: bool,
    payload: Guid,
    subscribers: Vec<Subscriber>,
    /// Latch counter
    count: i64,
    /// Latch has seen at least one increment (or a positive initial count)
    armed: bool,
    /// Counted: declared subscribers not yet bound
    remaining: u32,
}

/// A synchronizer event
pub struct Event {
    kind: EventKind,
    params: EventParams,
    core: Mutex<EventCore>,
}

impl Event {
    /// Create an event of `kind`
    pub fn new(kind: EventKind, params: EventParams) -> Self {
        Self {
            kind,
            params,
            core: Mutex::new(EventCore {
                satisfied: false,
                payload: NULL_GUID,
                subscribers: Vec::new(),
                count: params.initial_count,
                armed: params.initial_count > 0,
                remaining: params.expected_subscribers,
            }),
        }
    }

    /// The variant tag
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Whether the event has fired
    pub fn is_satisfied(&self) -> bool {
        self.core.lock().satisfied
    }

    /// The carried payload, once satisfied
    pub fn payload(&self) -> Option<Guid> {
        let core = self.core.lock();
        core.satisfied.then_some(core.payload)
    }

    /// Record a subscriber, atomically w.r.t. concurrent satisfaction
    ///
    /// If the event is already satisfied the binding takes effect
    /// immediately and the caller delivers the returned payload.
    pub fn bind(&self, guid: Guid, sub: Subscriber) -> Result<BindOutcome> {
        let mut core = self.core.lock();

        if self.kind == EventKind::Counted {
            if core.remaining == 0 {
                return Err(WeftError::SubscriberOverflow {
                    guid,
                    expected: self.params.expected_subscribers,
                });
            }
            core.remaining -= 1;
        }

        if core.satisfied {
            if self.kind == EventKind::Once {
                return Err(WeftError::invalid_call(
                    "once event does not accept subscribers after satisfaction",
                ));
            }
            let destroy = self.kind == EventKind::Counted && core.remaining == 0;
            trace!(?guid, consumer = ?sub.consumer, "late bind served immediately");
            return Ok(BindOutcome::Immediate {
                payload: core.payload,
                destroy,
            });
        }

        core.subscribers.push(sub);
        Ok(BindOutcome::Recorded)
    }

    /// Remove a recorded subscriber (pre-dispatch task destruction)
    ///
    /// A subscriber that was already delivered is simply absent; that is not
    /// an error, the unbind races cleanly with satisfaction.
    pub fn unbind(&self, consumer: Guid, slot: u32) {
        let mut core = self.core.lock();
        core.subscribers
            .retain(|s| !(s.consumer == consumer && s.slot == slot));
    }

    /// Satisfy the event (or one of a latch's counter slots)
    pub fn satisfy(&self, guid: Guid, payload: Guid, slot: u32) -> Result<SatisfyOutcome> {
        let mut core = self.core.lock();
        match self.kind {
            EventKind::Latch => {
                match slot {
                    LATCH_INCR_SLOT => {
                        core.count += 1;
                        core.armed = true;
                    }
                    LATCH_DECR_SLOT => {
                        core.count -= 1;
                    }
                    other => {
                        return Err(WeftError::invalid_call(format!(
                            "latch slot {other} is neither increment nor decrement"
                        )));
                    }
                }
                if core.count < 0 {
                    return Err(WeftError::invalid_call(
                        "latch counter decremented below zero",
                    ));
                }
                if core.armed && core.count == 0 {
                    if core.satisfied {
                        return Err(WeftError::EventAlreadySatisfied { guid });
                    }
                    core.satisfied = true;
                    // A latch fires with no carried value
                    core.payload = NULL_GUID;
                    trace!(?guid, "latch returned to zero, firing");
                    return Ok(SatisfyOutcome::Fired {
                        payload: NULL_GUID,
                        subscribers: std::mem::take(&mut core.subscribers),
                        destroy: true,
                    });
                }
                Ok(SatisfyOutcome::Pending)
            }
            EventKind::Idempotent if core.satisfied => Ok(SatisfyOutcome::Ignored),
            _ => {
                if core.satisfied {
                    return Err(WeftError::EventAlreadySatisfied { guid });
                }
                if slot != 0 {
                    return Err(WeftError::invalid_call(format!(
                        "event slot {slot} on a non-latch event"
                    )));
                }
                core.satisfied = true;
                core.payload = payload;
                let destroy = match self.kind {
                    EventKind::Once => true,
                    EventKind::Counted => core.remaining == 0,
                    _ => self.params.auto_destroy,
                };
                trace!(?guid, ?payload, kind = ?self.kind, "event fired");
                Ok(SatisfyOutcome::Fired {
                    payload,
                    subscribers: std::mem::take(&mut core.subscribers),
                    destroy,
                })
            }
        }
    }

    /// Number of recorded, undelivered subscribers (diagnostics)
    pub fn subscriber_count(&self) -> usize {
        self.core.lock().subscribers.len()
    }
}
