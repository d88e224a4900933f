//! Deferred request dispatch
//!
//! A device has at most one request waiting for the work queue. New requests replace the waiting one, except that an
//! idle request never replaces anything. At most one work item per device is in the scheduler at a time; a request
//! that arrives while the work item is running is picked up by a fresh item once the current one finishes.
use crate::device::{Request, State};
use crate::{Device, Error, Outcome, RpmFlags, debug, error, trace};

impl Device {
    /// Record `request` for the work queue, must be called with the device lock held
    pub(crate) fn queue_request(&'static self, state: &mut State, request: Request) -> Result<Outcome, Error> {
        if request == Request::Idle && state.request_pending && state.request > Request::Idle {
            return Ok(Outcome::Queued);
        }

        state.request = request;
        if state.request_pending {
            return Ok(Outcome::Queued);
        }

        state.request_pending = true;
        if state.work_queued || state.work_running {
            return Ok(Outcome::Queued);
        }

        if self.scheduler().queue_work(self) {
            state.work_queued = true;
            Ok(Outcome::Queued)
        } else {
            error!("Device {}: failed to queue {:?} request", self.id().0, request);
            state.request_pending = false;
            state.request = Request::None;
            Err(Error::QueueFull)
        }
    }

    /// Run the request waiting for the work queue.
    ///
    /// Called by the worker for each work item the device queued through its scheduler.
    pub async fn run_work(&'static self) {
        let request = self.lock(|state| {
            state.work_queued = false;
            if !state.request_pending {
                return Request::None;
            }

            state.request_pending = false;
            state.work_running = true;
            core::mem::take(&mut state.request)
        });

        let result = match request {
            Request::None => None,
            Request::Idle => Some(self.rpm_idle(RpmFlags::NOWAIT).await),
            Request::Suspend => Some(self.rpm_suspend(RpmFlags::NOWAIT).await),
            Request::Autosuspend => Some(self.rpm_suspend(RpmFlags::NOWAIT | RpmFlags::AUTO).await),
            Request::Resume => Some(self.rpm_resume(RpmFlags::NOWAIT).await),
        };

        match result {
            Some(Ok(outcome)) => trace!("Device {}: {:?} request done: {:?}", self.id().0, request, outcome),
            Some(Err(e)) => debug!("Device {}: {:?} request failed: {:?}", self.id().0, request, e),
            None => {}
        }

        self.finish_work();
    }

    /// Mark the running work item done and queue a fresh one if another request came in meanwhile
    fn finish_work(&'static self) {
        self.lock(|state| {
            state.work_running = false;
            state.wake_all();
            if !state.request_pending || state.work_queued {
                return;
            }

            if self.scheduler().queue_work(self) {
                state.work_queued = true;
            } else {
                error!("Device {}: failed to requeue {:?} request", self.id().0, state.request);
                state.request_pending = false;
                state.request = Request::None;
            }
        });
    }
}
