//! Resume transitions
//!
//! A parent has to be active before its child resumes. Rather than recursing into the parent, the resume keeps an
//! explicit stack of devices waiting for their parent, bounded by [`MAX_HIERARCHY_DEPTH`].
use embassy_futures::yield_now;
use embassy_time::Instant;
use heapless::Vec;

use crate::callback::Operation;
use crate::device::{Request, RuntimeStatus, State};
use crate::{Device, Error, MAX_HIERARCHY_DEPTH, Outcome, RpmFlags, debug, hierarchy, trace, warn};

/// Resume of a single device in the chain
struct Frame {
    device: &'static Device,
    flags: RpmFlags,
    /// The parent has been dealt with and gets counted once this device is active
    parent_held: bool,
    /// A usage reference is held on the parent
    parent_ref: bool,
}

impl Frame {
    fn new(device: &'static Device, flags: RpmFlags) -> Self {
        Self {
            device,
            flags,
            parent_held: false,
            parent_ref: false,
        }
    }

    fn release_parent(&mut self) {
        if core::mem::take(&mut self.parent_ref) {
            if let Some(parent) = self.device.parent() {
                hierarchy::release_parent(parent);
            }
        }
    }
}

/// Result of a resume pass with the device lock held
enum ResumeStep {
    Finish(Result<Outcome, Error>),
    /// Another transition is running, sleep until it is done
    Wait,
    /// Another transition is running on an irq-safe device
    Spin,
    /// Resume the parent first
    ResumeParent(&'static Device),
    /// The status went straight to active
    Committed,
    /// Status is resuming, run the callback
    Invoke,
}

impl Device {
    fn resume_step(&'static self, state: &mut State, frame: &mut Frame, now: Instant) -> ResumeStep {
        if state.runtime_error.is_some() {
            return ResumeStep::Finish(Err(Error::RuntimeError));
        }

        if state.disable_depth > 0 {
            // Resuming a device that was active when runtime PM got disabled is fine
            let outcome = if state.status == RuntimeStatus::Active && state.last_status == Some(RuntimeStatus::Active)
            {
                Ok(Outcome::NoChange)
            } else {
                Err(Error::Disabled)
            };
            return ResumeStep::Finish(outcome);
        }

        state.request = Request::None;
        if !state.timer_autosuspends {
            state.deactivate_timer();
        }

        if state.status == RuntimeStatus::Active {
            return ResumeStep::Finish(Ok(Outcome::NoChange));
        }

        if state.in_transition() {
            if frame.flags.no_wait() {
                if state.status == RuntimeStatus::Suspending {
                    state.deferred_resume = true;
                    let outcome = if frame.flags.contains(RpmFlags::NOWAIT) {
                        Err(Error::InProgress)
                    } else {
                        Ok(Outcome::Queued)
                    };
                    return ResumeStep::Finish(outcome);
                }
                return ResumeStep::Finish(Err(Error::InProgress));
            }

            return if state.irq_safe {
                ResumeStep::Spin
            } else {
                ResumeStep::Wait
            };
        }

        if state.no_callbacks && !frame.parent_held {
            if let Some(parent) = self.parent() {
                if hierarchy::activate_child_if_parent_allows(parent) {
                    self.resume_commit(state, false, now);
                    return ResumeStep::Committed;
                }
            }
        }

        if frame.flags.contains(RpmFlags::ASYNC) {
            return ResumeStep::Finish(self.queue_request(state, Request::Resume));
        }

        if !frame.parent_held {
            if let Some(parent) = self.parent() {
                frame.parent_held = true;
                // Irq-safe devices sit under parents that are never suspended
                if !state.irq_safe {
                    return ResumeStep::ResumeParent(parent);
                }
            }
        }

        if state.no_callbacks {
            self.resume_commit(state, frame.parent_held, now);
            return ResumeStep::Committed;
        }

        state.update_status(RuntimeStatus::Resuming, now);
        ResumeStep::Invoke
    }

    fn resume_commit(&self, state: &mut State, count_parent: bool, now: Instant) {
        state.update_status(RuntimeStatus::Active, now);
        state.last_busy = now;
        if count_parent {
            if let Some(parent) = self.parent() {
                hierarchy::notify_parent_of_active_child(parent);
            }
        }
        state.wake_all();
    }

    /// Give the freshly resumed device a chance to go idle again
    fn idle_after_resume(&'static self) {
        if let Err(e) = self.idle_nowait(RpmFlags::ASYNC) {
            trace!("Device {}: no idle after resume: {:?}", self.id().0, e);
        }
    }

    async fn invoke_resume(&'static self, count_parent: bool) -> Result<Outcome, Error> {
        trace!("Device {}: runtime resume", self.id().0);
        let result = self.run_callback(Operation::Resume).await;
        self.lock(|state| {
            let now = Instant::now();
            state.runtime_error = result.err();
            match result {
                Ok(()) => self.resume_commit(state, count_parent, now),
                Err(_) => {
                    state.update_status(RuntimeStatus::Suspended, now);
                    state.cancel_pending();
                    state.wake_all();
                }
            }
        });

        match result {
            Ok(()) => {
                self.idle_after_resume();
                Ok(Outcome::Completed)
            }
            Err(e) => {
                warn!("Device {}: runtime resume failed: {:?}", self.id().0, e);
                Err(Error::Callback(e))
            }
        }
    }

    /// Resume the device and, first, any suspended ancestors
    pub(crate) async fn rpm_resume(&'static self, flags: RpmFlags) -> Result<Outcome, Error> {
        if flags.contains(RpmFlags::ASYNC) {
            return self.resume_nowait(flags);
        }

        let mut current = Frame::new(self, flags);
        let mut waiting: Vec<Frame, MAX_HIERARCHY_DEPTH> = Vec::new();
        loop {
            let device = current.device;
            let step = device.lock(|state| device.resume_step(state, &mut current, Instant::now()));
            let mut result = match step {
                ResumeStep::Finish(result) => result,
                ResumeStep::Wait => {
                    device.wait_until(|state| !state.in_transition()).await;
                    continue;
                }
                ResumeStep::Spin => {
                    yield_now().await;
                    continue;
                }
                ResumeStep::Committed => {
                    device.idle_after_resume();
                    Ok(Outcome::Completed)
                }
                ResumeStep::Invoke => device.invoke_resume(current.parent_held).await,
                ResumeStep::ResumeParent(parent) => {
                    parent.get_noresume();
                    current.parent_ref = true;
                    if !parent.lock(|state| state.disable_depth == 0 && !state.ignore_children) {
                        continue;
                    }

                    let child = core::mem::replace(&mut current, Frame::new(parent, RpmFlags::empty()));
                    match waiting.push(child) {
                        Ok(()) => continue,
                        Err(child) => {
                            warn!("Device {}: parent chain too deep", child.device.id().0);
                            current = child;
                            Err(Error::HierarchyTooDeep)
                        }
                    }
                }
            };

            // The current device is done: drop its parent reference, then let the child waiting on it continue, or
            // fail as well if it did not end up active
            loop {
                current.release_parent();
                let Some(child) = waiting.pop() else {
                    return result;
                };

                let parent_active = current.device.status() == RuntimeStatus::Active;
                current = child;
                if parent_active {
                    break;
                }

                debug!("Device {}: parent did not resume", current.device.id().0);
                result = Err(result.err().unwrap_or(Error::Busy));
            }
        }
    }

    /// Resume without waiting, the callback always runs on the work queue
    pub(crate) fn resume_nowait(&'static self, flags: RpmFlags) -> Result<Outcome, Error> {
        let mut frame = Frame::new(self, flags | RpmFlags::ASYNC);
        match self.lock(|state| self.resume_step(state, &mut frame, Instant::now())) {
            ResumeStep::Finish(result) => result,
            ResumeStep::Committed => {
                self.idle_after_resume();
                Ok(Outcome::Completed)
            }
            // Async requests are queued before the parent is touched or the status changes
            ResumeStep::Wait | ResumeStep::Spin | ResumeStep::ResumeParent(_) | ResumeStep::Invoke => {
                Err(Error::InProgress)
            }
        }
    }
}
