//! Weft - Event-driven tasking runtime
//!
//! A continuation-passing DAG runtime: user code declares *tasks* with a
//! fixed number of parameters and dependence slots, *events* that gate them,
//! and *data blocks* whose handles flow along the edges. A task runs to
//! completion exactly once, when every slot has been satisfied, and chains
//! follow-on work through its output event. Co-located policy domains talk
//! over lock-free slot queues; a runlevel machine walks all subsystems
//! through bring-up and tear-down.

pub mod comqueue;
pub mod constants;
pub mod datablock;
pub mod domain;
pub mod error;
pub mod event;
pub mod guid;
pub mod registry;
pub mod runlevel;
pub mod runtime;
pub mod task;
pub mod transport;
pub mod worker;

// Re-export main components
pub use comqueue::{ SlotQueue, SlotState };
pub use datablock::{ AccessMode, DataBlock, DbAccess, DbFlags };
pub use domain::{ PolicyDomain, ShutdownCause, TaskScope };
pub use error::{ ErrorCode, Result, WeftError };
pub use event::{ EventKind, EventParams, LATCH_DECR_SLOT, LATCH_INCR_SLOT };
pub use guid::{ Guid, GuidKind, ERROR_GUID, NULL_GUID, UNINITIALIZED_GUID };
pub use registry::GuidRegistry;
pub use runlevel::{ Runlevel, RunlevelMachine };
pub use runtime::{ arg, args_count, Runtime, RuntimeConfig };
pub use task::{ TaskFn, TaskInput, TaskProps };
pub use transport::{
    DomainEndpoint, MessageBody, PolicyMessage, SendProps, TransportConfig, TransportFabric,
};
pub use worker::{ current_task, current_worker };

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
