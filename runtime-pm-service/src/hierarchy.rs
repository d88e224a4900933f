//! Parent bookkeeping
//!
//! A parent that cares about its children counts the active ones. A parent ignoring its children keeps no count, is
//! never held up by them and is not asked to go idle when a child suspends. These helpers are called with the
//! child's lock held and take the parent's lock nested beneath.
use crate::{Device, Error, RpmFlags, RuntimeStatus, trace};

/// A child of `parent` became active
pub(crate) fn notify_parent_of_active_child(parent: &Device) {
    parent.lock(|state| {
        if !state.ignore_children {
            state.child_count = state.child_count.saturating_add(1);
        }
    });
}

/// A child of `parent` suspended, returns true if the parent should be offered an idle check
pub(crate) fn notify_parent_of_suspended_child(parent: &Device) -> bool {
    parent.lock(|state| {
        if state.ignore_children {
            return false;
        }

        state.child_count = state.child_count.saturating_sub(1);
        true
    })
}

/// Count a child that comes up without callbacks, if the parent does not have to be resumed for it
pub(crate) fn activate_child_if_parent_allows(parent: &Device) -> bool {
    parent.lock(|state| {
        if state.ignore_children {
            return true;
        }

        let allowed = state.disable_depth > 0 || state.status == RuntimeStatus::Active;
        if allowed {
            state.child_count = state.child_count.saturating_add(1);
        }
        allowed
    })
}

/// Count a child that is administratively set active.
///
/// An enabled parent that cares about its children has to be active already.
pub(crate) fn adopt_active_child(parent: &Device, child_was_suspended: bool) -> Result<(), Error> {
    parent.lock(|state| {
        if state.ignore_children {
            return Ok(());
        }

        if state.disable_depth == 0 && state.status != RuntimeStatus::Active {
            return Err(Error::Busy);
        }

        if child_was_suspended {
            state.child_count = state.child_count.saturating_add(1);
        }
        Ok(())
    })
}

/// Offer the parent an idle check after one of its children suspended, must be called without the child's lock
pub(crate) fn request_parent_idle(parent: &'static Device) {
    if let Err(e) = parent.idle_nowait(RpmFlags::ASYNC) {
        trace!("Device {}: parent idle not queued: {:?}", parent.id().0, e);
    }
}

/// Drop a usage reference taken on the parent while resuming a child
pub(crate) fn release_parent(parent: &'static Device) {
    if let Err(e) = parent.put() {
        trace!("Device {}: parent put: {:?}", parent.id().0, e);
    }
}
