//! Runtime power management for device trees
//!
//! Every [`Device`] tracks its own runtime power state and decides when the driver's suspend, resume and idle
//! callbacks run. Drivers hold the device active through a usage count ([`Device::get_sync`], [`Device::put`]),
//! request transitions synchronously or through the work queue, and let the autosuspend timer put the device to
//! sleep once it has been idle long enough. Parents are resumed before their children and are offered an idle check
//! when their last active child suspends.
//!
//! Deferred work and timers run on an injected [`queue::Scheduler`]; [`queue::WorkQueue`] together with
//! [`task::worker`] and [`task::timer`] is the default implementation.

#![no_std]
#![warn(missing_docs)]

#[cfg(test)]
extern crate std;

pub mod admin;
pub mod autosuspend;
pub mod callback;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod flags;
pub mod fmt;
pub mod hierarchy;
pub mod idle;
pub mod policy;
pub mod queue;
pub mod resume;
pub mod suspend;
pub mod task;
pub mod usage;

#[cfg(test)]
mod test;

pub use callback::{CallbackError, CallbackResult, Operation, Provider, RuntimeCallbacks};
pub use config::Config;
pub use device::{Device, Request, RuntimeStatus};
pub use flags::RpmFlags;
pub use policy::{Allowed, Deny};

/// Raw mutex used for every device lock.
///
/// Irq-safe devices may be locked from interrupt context, so the lock always has to mask interrupts. A critical
/// section gives that on every target and is also the implementation used for unit tests on the host.
pub type GlobalRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

/// AtomicUsize and Ordering re-exports. Uses core::sync::atomic if the target supports atomic operations,
/// otherwise falls back to portable-atomic crate.
#[cfg(target_has_atomic = "ptr")]
pub use core::sync::atomic::AtomicUsize;
#[cfg(target_has_atomic = "ptr")]
pub use core::sync::atomic::Ordering;
#[cfg(not(target_has_atomic = "ptr"))]
pub use portable_atomic::AtomicUsize;
#[cfg(not(target_has_atomic = "ptr"))]
pub use portable_atomic::Ordering;

/// Longest chain of ancestors a single resume will walk through
pub const MAX_HIERARCHY_DEPTH: usize = 8;

/// Device ID new type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceId(pub u8);

/// Error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Runtime PM is disabled for the device
    Disabled,
    /// The usage count keeps the device active
    Busy,
    /// Active children keep the device active
    ChildBusy,
    /// A resume is pending or the device is not in a state that allows the request
    TryAgain,
    /// Another transition is running and the caller asked not to wait for it
    InProgress,
    /// A previous callback failed and the error has not been cleared
    RuntimeError,
    /// A resume latency constraint of zero forbids suspending
    Forbidden,
    /// The driver callback failed
    Callback(CallbackError),
    /// More puts than gets
    UsageUnderflow,
    /// Administrative status changes require runtime PM to be disabled
    Enabled,
    /// Only [`RuntimeStatus::Active`] and [`RuntimeStatus::Suspended`] can be set administratively
    InvalidStatus,
    /// The chain of parents is deeper than [`MAX_HIERARCHY_DEPTH`]
    HierarchyTooDeep,
    /// The scheduler had no room for the request
    QueueFull,
}

/// Successful result of a runtime PM request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// The transition was carried out
    Completed,
    /// The device already was in the requested state, or nothing had to be done
    NoChange,
    /// The request was handed to the work queue, or recorded as a deferred resume
    Queued,
    /// A suspend timer was armed
    Scheduled,
}
