//! Idle notifications
//!
//! An idle check runs the driver's idle callback and, unless the driver objects, goes on to an autosuspend.
use crate::callback::Operation;
use crate::device::{Request, RuntimeStatus, State};
use crate::{Device, Error, Outcome, RpmFlags, policy, trace};

/// Result of an idle pass with the device lock held
enum IdleStep {
    Finish(Result<Outcome, Error>),
    /// No callback to run, go straight to suspend
    Suspend,
    /// Idle notification set, run the callback
    Invoke,
}

impl Device {
    fn idle_step(&'static self, state: &mut State, flags: RpmFlags) -> IdleStep {
        if let Err(deny) = policy::evaluate(state) {
            return IdleStep::Finish(Err(deny.into()));
        }

        if state.status != RuntimeStatus::Active {
            return IdleStep::Finish(Err(Error::TryAgain));
        }

        // A suspend or resume is already on its way
        if state.request_pending && state.request > Request::Idle {
            return IdleStep::Finish(Err(Error::TryAgain));
        }

        if state.idle_notification {
            return IdleStep::Finish(Err(Error::InProgress));
        }

        state.request = Request::None;

        if state.no_callbacks || !self.has_callback(Operation::Idle) {
            return IdleStep::Suspend;
        }

        if flags.contains(RpmFlags::ASYNC) {
            return IdleStep::Finish(self.queue_request(state, Request::Idle));
        }

        state.idle_notification = true;
        IdleStep::Invoke
    }

    /// Run an idle check, waiting for the callback unless [`RpmFlags::ASYNC`] is set
    pub(crate) async fn rpm_idle(&'static self, flags: RpmFlags) -> Result<Outcome, Error> {
        if flags.contains(RpmFlags::ASYNC) {
            return self.idle_nowait(flags);
        }

        match self.lock(|state| self.idle_step(state, flags)) {
            IdleStep::Finish(result) => result,
            IdleStep::Suspend => self.rpm_suspend(flags | RpmFlags::AUTO).await,
            IdleStep::Invoke => {
                trace!("Device {}: runtime idle", self.id().0);
                let result = self.run_callback(Operation::Idle).await;
                self.lock(|state| {
                    state.idle_notification = false;
                    state.wake_all();
                });

                match result {
                    Ok(()) => self.rpm_suspend(flags | RpmFlags::AUTO).await,
                    Err(e) => Err(Error::Callback(e)),
                }
            }
        }
    }

    /// Idle check without waiting, the callback always runs on the work queue
    pub(crate) fn idle_nowait(&'static self, flags: RpmFlags) -> Result<Outcome, Error> {
        let flags = flags | RpmFlags::ASYNC;
        match self.lock(|state| self.idle_step(state, flags)) {
            IdleStep::Finish(result) => result,
            IdleStep::Suspend => self.suspend_nowait(flags | RpmFlags::AUTO),
            // Async requests are queued before the notification is set
            IdleStep::Invoke => Err(Error::InProgress),
        }
    }
}
