//! Suspend admission policy
use embassy_time::Duration;

use crate::device::{Request, RuntimeStatus, State};
use crate::{Device, Error};

/// Suspending is allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Allowed {
    /// The device may be suspended
    Proceed,
    /// The device already is suspended
    AlreadySuspended,
}

/// Reason suspending is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Deny {
    /// A previous callback failed
    RuntimeError,
    /// Runtime PM is disabled
    Disabled,
    /// The usage count is positive
    Busy,
    /// Children are active and not ignored
    ChildBusy,
    /// A resume is pending or deferred
    RaceWithResume,
    /// The resume latency constraint is zero
    Forbidden,
}

impl From<Deny> for Error {
    fn from(deny: Deny) -> Self {
        match deny {
            Deny::RuntimeError => Error::RuntimeError,
            Deny::Disabled => Error::Disabled,
            Deny::Busy => Error::Busy,
            Deny::ChildBusy => Error::ChildBusy,
            Deny::RaceWithResume => Error::TryAgain,
            Deny::Forbidden => Error::Forbidden,
        }
    }
}

/// Decide whether the device may be suspended, checks run in a fixed order and the first failing one wins
pub(crate) fn evaluate(state: &State) -> Result<Allowed, Deny> {
    if state.runtime_error.is_some() {
        Err(Deny::RuntimeError)
    } else if state.disable_depth > 0 {
        Err(Deny::Disabled)
    } else if state.usage_count > 0 {
        Err(Deny::Busy)
    } else if !state.ignore_children && state.child_count > 0 {
        Err(Deny::ChildBusy)
    } else if (state.deferred_resume && state.status == RuntimeStatus::Suspending)
        || (state.request_pending && state.request == Request::Resume)
    {
        Err(Deny::RaceWithResume)
    } else if state.resume_latency == Some(Duration::from_ticks(0)) {
        Err(Deny::Forbidden)
    } else if state.status == RuntimeStatus::Suspended {
        Ok(Allowed::AlreadySuspended)
    } else {
        Ok(Allowed::Proceed)
    }
}

impl Device {
    /// Check whether the device could be suspended right now
    pub fn may_suspend(&self) -> Result<Allowed, Deny> {
        self.lock(|state| evaluate(state))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::callback::CallbackError;
    use crate::config::Config;
    use rstest::rstest;

    fn enabled_active() -> State {
        let mut state = State::new(Config::default());
        state.disable_depth = 0;
        state.status = RuntimeStatus::Active;
        state
    }

    #[test]
    fn test_proceed() {
        assert_eq!(evaluate(&enabled_active()), Ok(Allowed::Proceed));
    }

    #[test]
    fn test_already_suspended() {
        let mut state = enabled_active();
        state.status = RuntimeStatus::Suspended;
        assert_eq!(evaluate(&state), Ok(Allowed::AlreadySuspended));
    }

    #[rstest]
    #[case::runtime_error(|s: &mut State| s.runtime_error = Some(CallbackError::Failed), Deny::RuntimeError)]
    #[case::disabled(|s: &mut State| s.disable_depth = 1, Deny::Disabled)]
    #[case::busy(|s: &mut State| s.usage_count = 1, Deny::Busy)]
    #[case::child_busy(|s: &mut State| s.child_count = 2, Deny::ChildBusy)]
    #[case::deferred_resume(|s: &mut State| {
        s.status = RuntimeStatus::Suspending;
        s.deferred_resume = true;
    }, Deny::RaceWithResume)]
    #[case::pending_resume(|s: &mut State| {
        s.request_pending = true;
        s.request = Request::Resume;
    }, Deny::RaceWithResume)]
    #[case::forbidden(|s: &mut State| s.resume_latency = Some(Duration::from_ticks(0)), Deny::Forbidden)]
    fn test_deny(#[case] setup: fn(&mut State), #[case] expected: Deny) {
        let mut state = enabled_active();
        setup(&mut state);
        assert_eq!(evaluate(&state), Err(expected));
    }

    #[test]
    fn test_ignore_children() {
        let mut state = enabled_active();
        state.child_count = 3;
        state.ignore_children = true;
        assert_eq!(evaluate(&state), Ok(Allowed::Proceed));
    }

    #[test]
    fn test_pending_suspend_is_not_a_race() {
        let mut state = enabled_active();
        state.request_pending = true;
        state.request = Request::Suspend;
        assert_eq!(evaluate(&state), Ok(Allowed::Proceed));
    }

    #[test]
    fn test_nonzero_latency_allowed() {
        let mut state = enabled_active();
        state.resume_latency = Some(Duration::from_micros(10));
        assert_eq!(evaluate(&state), Ok(Allowed::Proceed));
    }

    #[test]
    fn test_check_order() {
        // Every condition fails at once, the runtime error is reported first
        let mut state = enabled_active();
        state.runtime_error = Some(CallbackError::Failed);
        state.disable_depth = 1;
        state.usage_count = 1;
        state.child_count = 1;
        assert_eq!(evaluate(&state), Err(Deny::RuntimeError));

        state.runtime_error = None;
        assert_eq!(evaluate(&state), Err(Deny::Disabled));

        state.disable_depth = 0;
        assert_eq!(evaluate(&state), Err(Deny::Busy));

        state.usage_count = 0;
        assert_eq!(evaluate(&state), Err(Deny::ChildBusy));
    }

    #[test]
    fn test_deny_to_error() {
        assert_eq!(Error::from(Deny::RaceWithResume), Error::TryAgain);
        assert_eq!(Error::from(Deny::ChildBusy), Error::ChildBusy);
        assert_eq!(Error::from(Deny::Forbidden), Error::Forbidden);
    }
}
