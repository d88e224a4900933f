//! Administrative control: enabling and disabling runtime PM, setting the status directly and device flags
use embassy_time::{Duration, Instant};

use crate::device::{Request, RuntimeStatus};
use crate::{Device, Error, RpmFlags, debug, hierarchy, trace, warn};

impl Device {
    /// Drop one level of runtime PM disabling
    pub fn enable(&self) {
        self.lock(|state| {
            if state.disable_depth > 0 {
                state.disable_depth -= 1;
                if state.disable_depth == 0 {
                    state.accounting_timestamp = Instant::now();
                    state.last_status = None;
                }
            } else {
                warn!("Device {}: unbalanced runtime PM enable", self.id().0);
            }

            if state.disable_depth == 0
                && state.status == RuntimeStatus::Suspended
                && !state.ignore_children
                && state.child_count > 0
            {
                warn!("Device {}: enabling runtime PM for inactive device with active children", self.id().0);
            }
        });
    }

    /// Disable runtime PM, nesting with earlier calls.
    ///
    /// The first level waits for every running transition and drops pending requests and timers. With
    /// `check_resume` a pending resume is carried out first.
    pub async fn disable(&'static self, check_resume: bool) {
        let resume_first = self.lock(|state| {
            if state.disable_depth > 0 {
                state.disable_depth += 1;
                return None;
            }

            Some(check_resume && state.request_pending && state.request == Request::Resume)
        });

        let Some(resume_first) = resume_first else {
            return;
        };

        if resume_first {
            self.get_noresume();
            if let Err(e) = self.rpm_resume(RpmFlags::empty()).await {
                debug!("Device {}: resume before disable failed: {:?}", self.id().0, e);
            }
            self.put_noidle();
        }

        let first = self.lock(|state| {
            state.update_accounting(Instant::now());
            state.disable_depth += 1;
            state.disable_depth == 1
        });

        if first {
            self.settle().await;
            self.lock(|state| state.last_status = Some(state.status));
        }
    }

    /// Drop pending work and wait for running transitions to finish
    async fn settle(&self) {
        self.lock(|state| {
            state.deactivate_timer();
            if state.request_pending {
                state.request = Request::None;
                state.request_pending = false;
            }
        });

        self.wait_until(|state| !state.in_transition() && !state.idle_notification && !state.work_running)
            .await;
    }

    /// Flush pending requests and wait for running transitions.
    ///
    /// A pending resume is carried out first, returns true if there was one.
    pub async fn barrier(&'static self) -> bool {
        self.get_noresume();
        let resume = self.lock(|state| state.request_pending && state.request == Request::Resume);
        if resume {
            if let Err(e) = self.rpm_resume(RpmFlags::empty()).await {
                debug!("Device {}: barrier resume failed: {:?}", self.id().0, e);
            }
        }

        self.settle().await;
        self.put_noidle();
        resume
    }

    /// Set the status to active while runtime PM is disabled
    pub fn set_active(&'static self) -> Result<(), Error> {
        self.set_status(RuntimeStatus::Active)
    }

    /// Set the status to suspended while runtime PM is disabled
    pub fn set_suspended(&'static self) -> Result<(), Error> {
        self.set_status(RuntimeStatus::Suspended)
    }

    /// Set the status directly, bypassing the callbacks.
    ///
    /// Only allowed while runtime PM is disabled or after a callback error, which this clears. An enabled parent that
    /// does not ignore its children must be active before a child can be set active.
    pub fn set_status(&'static self, status: RuntimeStatus) -> Result<(), Error> {
        if !matches!(status, RuntimeStatus::Active | RuntimeStatus::Suspended) {
            return Err(Error::InvalidStatus);
        }

        // Hold runtime PM off while the status is rewritten
        let allowed = self.lock(|state| {
            if state.runtime_error.is_some() || state.disable_depth > 0 {
                state.disable_depth += 1;
                true
            } else {
                false
            }
        });

        if !allowed {
            return Err(Error::Enabled);
        }

        let (result, idle_parent) = self.lock(|state| {
            let mut result = Ok(());
            let mut idle_parent = None;
            let mut status = status;

            if state.status != status {
                if let Some(parent) = self.parent() {
                    if status == RuntimeStatus::Suspended {
                        if hierarchy::notify_parent_of_suspended_child(parent) {
                            idle_parent = Some(parent);
                        }
                    } else if let Err(e) =
                        hierarchy::adopt_active_child(parent, state.status == RuntimeStatus::Suspended)
                    {
                        warn!("Device {}: cannot set active, parent {} is not", self.id().0, parent.id().0);
                        result = Err(e);
                        status = RuntimeStatus::Suspended;
                    }
                }
            }

            state.update_status(status, Instant::now());
            if result.is_ok() {
                state.runtime_error = None;
            }
            (result, idle_parent)
        });

        if let Some(parent) = idle_parent {
            hierarchy::request_parent_idle(parent);
        }

        self.enable();
        result
    }

    /// Keep the device active regardless of its usage count, until [`Device::allow`]
    pub async fn forbid(&'static self) {
        let forbidden = self.lock(|state| {
            if !state.runtime_auto {
                return false;
            }

            state.runtime_auto = false;
            state.usage_count += 1;
            true
        });

        if forbidden {
            if let Err(e) = self.rpm_resume(RpmFlags::empty()).await {
                debug!("Device {}: resume on forbid failed: {:?}", self.id().0, e);
            }
        }
    }

    /// Undo [`Device::forbid`]
    pub fn allow(&'static self) {
        let idle = self.lock(|state| {
            if state.runtime_auto {
                return false;
            }

            state.runtime_auto = true;
            match state.drop_usage() {
                Ok(remaining) => remaining == 0,
                Err(_) => {
                    warn!("Device {}: usage count underflow on allow", self.id().0);
                    false
                }
            }
        });

        if idle {
            if let Err(e) = self.idle_nowait(RpmFlags::ASYNC | RpmFlags::AUTO) {
                trace!("Device {}: no idle on allow: {:?}", self.id().0, e);
            }
        }
    }

    /// Mark the device irq-safe.
    ///
    /// Transitions may then run from interrupt context: waits become spins, and the parent is resumed now and
    /// kept active for good.
    pub async fn irq_safe(&'static self) {
        if self.is_irq_safe() {
            return;
        }

        if let Some(parent) = self.parent() {
            if let Err(e) = parent.get_sync().await {
                warn!("Device {}: parent resume failed: {:?}", self.id().0, e);
            }
        }
        self.lock(|state| state.irq_safe = true);
    }

    /// Mark the device as having no callbacks, transitions then only update bookkeeping
    pub fn no_callbacks(&self) {
        self.lock(|state| state.no_callbacks = true);
    }

    /// Choose whether active children keep the device active
    pub fn set_ignore_children(&self, ignore: bool) {
        self.lock(|state| state.ignore_children = ignore);
    }

    /// Set the resume latency constraint, a zero latency forbids runtime suspend
    pub fn set_resume_latency(&self, latency: Option<Duration>) {
        self.lock(|state| state.resume_latency = latency);
    }

    /// Tear down runtime PM for a device that is going away.
    ///
    /// Leaves runtime PM disabled, the status suspended and releases the parent reference held for an irq-safe device.
    pub async fn remove(&'static self) {
        self.disable(false).await;

        if self.status() == RuntimeStatus::Active {
            if let Err(e) = self.set_suspended() {
                warn!("Device {}: set suspended on remove failed: {:?}", self.id().0, e);
            }
        }

        let was_irq_safe = self.lock(|state| core::mem::take(&mut state.irq_safe));
        if was_irq_safe {
            if let Some(parent) = self.parent() {
                hierarchy::release_parent(parent);
            }
        }
    }
}
