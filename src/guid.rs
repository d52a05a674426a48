//! Opaque handles naming runtime objects
//!
//! Every runtime object (task, event, data block, template) is named by a
//! [`Guid`]: an opaque, totally-ordered 64-bit identifier issued by the
//! handle registry. Three values are reserved and never issued:
//!
//! - [`NULL_GUID`] names no object; comparing against it is the standard
//!   termination check.
//! - [`UNINITIALIZED_GUID`] is a placeholder meaning "to be supplied later"
//!   (e.g. a dependence slot that will be bound by a later `add_dependence`).
//! - [`ERROR_GUID`] represents a failed resolution; user tasks publish it on
//!   their output event to surface a fault downstream.

use serde::{ Deserialize, Serialize };

/// The null handle: names no object
pub const NULL_GUID: Guid = Guid(0);

/// Placeholder handle for a value to be supplied later
pub const UNINITIALIZED_GUID: Guid = Guid(u64::MAX);

/// Handle representing a failed resolution
pub const ERROR_GUID: Guid = Guid(u64::MAX - 1);

/// An opaque, totally-ordered identifier naming a runtime object
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub struct Guid(u64);

impl Guid {
    /// Reconstruct a handle from its raw representation
    ///
    /// Only meaningful for values previously obtained via [`Guid::as_raw`],
    /// typically after a round-trip through a task parameter word.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw representation, suitable for storing in a task parameter word
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Check whether this is the null handle
    pub fn is_null(self) -> bool {
        self == NULL_GUID
    }

    /// Check whether this is the uninitialized placeholder
    pub fn is_uninitialized(self) -> bool {
        self == UNINITIALIZED_GUID
    }

    /// Check whether this is the error handle
    pub fn is_error(self) -> bool {
        self == ERROR_GUID
    }

    /// Check whether this is any of the three reserved values
    pub fn is_reserved(self) -> bool {
        self.is_null() || self.is_uninitialized() || self.is_error()
    }
}

impl Default for Guid {
    fn default() -> Self {
        NULL_GUID
    }
}

/// The kind of object a live handle resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum GuidKind {
    /// An event-driven task
    Task = 0,
    /// A synchronizer event
    Event = 1,
    /// A payload data block
    DataBlock = 2,
    /// A reusable task template
    Template = 3,
}

impl GuidKind {
    /// Human-readable kind name for diagnostics
    pub fn name(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Event => "event",
            Self::DataBlock => "data block",
            Self::Template => "template",
        }
    }
}
