//! Runtime tuning constants and configuration values
//!
//! This module contains the tunables used throughout the weft runtime:
//! queue capacities, poll weights, worker defaults, and message layout
//! limits.

/// Default capacity of an inter-domain slot queue (slots per queue)
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Maximum slot index encodable in a response address (one byte)
pub const MAX_ENCODABLE_SLOTS: usize = 256;

/// Maximum marshalled payload bytes that fit in a slot's inline buffer
pub const MAX_INLINE_PAYLOAD: usize = 1024;

/// Consecutive polls of the downstream inbound queue per cycle
pub const INQUEUE_POLL_DOWNSTREAM: u32 = 2;

/// Consecutive polls of the upstream inbound queue per cycle
pub const INQUEUE_POLL_UPSTREAM: u32 = 1;

/// Default number of bring-up/tear-down phases per runlevel
pub const DEFAULT_PHASES_PER_RUNLEVEL: u32 = 1;

/// Upper bound on phases a subsystem may request at any runlevel
pub const MAX_PHASES_PER_RUNLEVEL: u32 = 8;

/// Default number of registry shards (must be a power of 2)
pub const REGISTRY_SHARDS: usize = 16;

/// Parameter count ceiling for a task template
pub const MAX_TASK_PARAMS: usize = 64;

/// Dependence count ceiling for a task template
pub const MAX_TASK_DEPS: usize = 1024;

/// Spin iterations before a parked worker yields to the OS
pub const WORKER_SPIN_BEFORE_PARK: u32 = 64;

/// Validate that all constants are properly configured
pub fn validate_constants() -> Result<(), &'static str> {
    if DEFAULT_QUEUE_CAPACITY == 0 {
        return Err("DEFAULT_QUEUE_CAPACITY must be greater than 0");
    }
    if DEFAULT_QUEUE_CAPACITY > MAX_ENCODABLE_SLOTS {
        return Err("DEFAULT_QUEUE_CAPACITY must fit in a one-byte slot address");
    }
    if MAX_INLINE_PAYLOAD == 0 {
        return Err("MAX_INLINE_PAYLOAD must be greater than 0");
    }
    if INQUEUE_POLL_DOWNSTREAM == 0 || INQUEUE_POLL_UPSTREAM == 0 {
        return Err("Poll weights must be greater than 0");
    }
    if !REGISTRY_SHARDS.is_power_of_two() {
        return Err("REGISTRY_SHARDS must be a power of 2");
    }
    if DEFAULT_PHASES_PER_RUNLEVEL == 0 || DEFAULT_PHASES_PER_RUNLEVEL > MAX_PHASES_PER_RUNLEVEL {
        return Err("DEFAULT_PHASES_PER_RUNLEVEL out of range");
    }
    Ok(())
}
