//! Suspend transitions
use embassy_futures::yield_now;
use embassy_time::Instant;

use crate::callback::{CallbackError, Operation};
use crate::device::{Request, RuntimeStatus, State};
use crate::policy::{self, Allowed};
use crate::{Device, Error, Outcome, RpmFlags, autosuspend, debug, hierarchy, trace, warn};

/// Result of a suspend pass with the device lock held
enum SuspendStep {
    Finish(Result<Outcome, Error>),
    /// Another suspend is running, sleep until it is done
    Wait,
    /// Another suspend is running on an irq-safe device
    Spin,
    /// The status went straight to suspended
    Committed(Committed),
    /// Status is suspending, run the callback
    Invoke,
    /// Autosuspend deferred, arm the timer for the new expiration
    Arm(Instant),
}

/// Follow-up work once the status is committed to suspended
#[must_use]
struct Committed {
    /// A resume came in while suspending
    deferred_resume: bool,
    /// Parent to offer an idle check
    idle_parent: Option<&'static Device>,
}

impl Device {
    fn suspend_step(&'static self, state: &mut State, flags: RpmFlags, now: Instant) -> SuspendStep {
        match policy::evaluate(state) {
            Ok(Allowed::Proceed) => {}
            Ok(Allowed::AlreadySuspended) => return SuspendStep::Finish(Ok(Outcome::NoChange)),
            Err(deny) => return SuspendStep::Finish(Err(deny.into())),
        }

        if state.status == RuntimeStatus::Resuming && !flags.contains(RpmFlags::ASYNC) {
            return SuspendStep::Finish(Err(Error::TryAgain));
        }

        if flags.contains(RpmFlags::AUTO) && state.status != RuntimeStatus::Suspending {
            if let Some(expires) = autosuspend::expiration(state, now) {
                state.request = Request::None;
                state.timer_autosuspends = true;
                // Never push an armed timer further out
                if state.timer_expires.is_some_and(|armed| armed <= expires) {
                    return SuspendStep::Finish(Ok(Outcome::Scheduled));
                }
                state.timer_expires = Some(expires);
                return SuspendStep::Arm(expires);
            }
        }

        state.cancel_pending();

        if state.status == RuntimeStatus::Suspending {
            if flags.no_wait() {
                return SuspendStep::Finish(Err(Error::InProgress));
            }

            return if state.irq_safe {
                SuspendStep::Spin
            } else {
                SuspendStep::Wait
            };
        }

        if state.no_callbacks {
            return SuspendStep::Committed(self.suspend_commit(state, now));
        }

        if flags.contains(RpmFlags::ASYNC) {
            let request = if flags.contains(RpmFlags::AUTO) {
                Request::Autosuspend
            } else {
                Request::Suspend
            };
            return SuspendStep::Finish(self.queue_request(state, request));
        }

        state.update_status(RuntimeStatus::Suspending, now);
        SuspendStep::Invoke
    }

    fn suspend_commit(&'static self, state: &mut State, now: Instant) -> Committed {
        state.update_status(RuntimeStatus::Suspended, now);
        state.deactivate_timer();

        let mut idle_parent = None;
        if let Some(parent) = self.parent() {
            if hierarchy::notify_parent_of_suspended_child(parent) && !state.irq_safe {
                idle_parent = Some(parent);
            }
        }

        state.wake_all();
        Committed {
            deferred_resume: core::mem::take(&mut state.deferred_resume),
            idle_parent,
        }
    }

    /// Back out of a failed suspend, returns true if an autosuspend should be retried
    fn suspend_failed(state: &mut State, err: CallbackError, flags: RpmFlags, now: Instant) -> bool {
        state.update_status(RuntimeStatus::Active, now);
        state.deferred_resume = false;
        state.wake_all();

        match err {
            CallbackError::Busy | CallbackError::TryAgain => {
                state.runtime_error = None;
                flags.contains(RpmFlags::AUTO) && autosuspend::expiration(state, now).is_some()
            }
            CallbackError::Failed => {
                state.cancel_pending();
                false
            }
        }
    }

    /// Suspend the device, waiting for the callback unless [`RpmFlags::ASYNC`] is set
    pub(crate) async fn rpm_suspend(&'static self, flags: RpmFlags) -> Result<Outcome, Error> {
        if flags.contains(RpmFlags::ASYNC) {
            return self.suspend_nowait(flags);
        }

        loop {
            match self.lock(|state| self.suspend_step(state, flags, Instant::now())) {
                SuspendStep::Finish(result) => return result,
                SuspendStep::Arm(expires) => {
                    self.scheduler().arm_timer(self, expires);
                    return Ok(Outcome::Scheduled);
                }
                SuspendStep::Wait => {
                    self.wait_until(|state| state.status != RuntimeStatus::Suspending)
                        .await
                }
                SuspendStep::Spin => yield_now().await,
                SuspendStep::Committed(committed) => return self.after_suspend(committed).await,
                SuspendStep::Invoke => {
                    trace!("Device {}: runtime suspend", self.id().0);
                    let result = self.run_callback(Operation::Suspend).await;
                    let step = self.lock(|state| {
                        let now = Instant::now();
                        state.runtime_error = result.err();
                        match result {
                            Ok(()) => Ok(self.suspend_commit(state, now)),
                            Err(e) => Err((e, Self::suspend_failed(state, e, flags, now))),
                        }
                    });

                    match step {
                        Ok(committed) => return self.after_suspend(committed).await,
                        Err((e, true)) => debug!("Device {}: suspend refused ({:?}), retrying", self.id().0, e),
                        Err((e, false)) => {
                            warn!("Device {}: runtime suspend failed: {:?}", self.id().0, e);
                            return Err(Error::Callback(e));
                        }
                    }
                }
            }
        }
    }

    async fn after_suspend(&'static self, committed: Committed) -> Result<Outcome, Error> {
        if committed.deferred_resume {
            if let Err(e) = self.rpm_resume(RpmFlags::empty()).await {
                debug!("Device {}: deferred resume failed: {:?}", self.id().0, e);
            }
            return Err(Error::TryAgain);
        }

        if let Some(parent) = committed.idle_parent {
            hierarchy::request_parent_idle(parent);
        }
        Ok(Outcome::Completed)
    }

    /// Suspend without waiting, the callback always runs on the work queue
    pub(crate) fn suspend_nowait(&'static self, flags: RpmFlags) -> Result<Outcome, Error> {
        let flags = flags | RpmFlags::ASYNC;
        match self.lock(|state| self.suspend_step(state, flags, Instant::now())) {
            SuspendStep::Finish(result) => result,
            SuspendStep::Arm(expires) => {
                self.scheduler().arm_timer(self, expires);
                Ok(Outcome::Scheduled)
            }
            SuspendStep::Committed(committed) => {
                if committed.deferred_resume {
                    self.lock(|state| self.queue_request(state, Request::Resume))?;
                    return Err(Error::TryAgain);
                }

                if let Some(parent) = committed.idle_parent {
                    hierarchy::request_parent_idle(parent);
                }
                Ok(Outcome::Completed)
            }
            // Async requests are queued before the status changes
            SuspendStep::Wait | SuspendStep::Spin | SuspendStep::Invoke => Err(Error::InProgress),
        }
    }
}
