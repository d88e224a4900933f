//! Usage counting and request entry points
//!
//! Methods without a `_sync` suffix never wait: the callback, if any, runs on the work queue. The `_sync` variants
//! run callbacks in the calling task and wait for transitions already in progress.
use crate::{Device, Error, Outcome, RpmFlags, warn};

impl Device {
    /// Take a usage reference without resuming the device
    pub fn get_noresume(&self) {
        self.lock(|state| state.usage_count += 1);
    }

    /// Drop a usage reference without an idle check, the count never goes below zero
    pub fn put_noidle(&self) {
        self.lock(|state| {
            if state.drop_usage().is_err() {
                warn!("Device {}: unbalanced put_noidle", self.id().0);
            }
        });
    }

    /// Drop a usage reference, returns true if it was the last one
    fn drop_reference(&self) -> Result<bool, Error> {
        self.lock(|state| state.drop_usage())
            .map(|remaining| remaining == 0)
            .inspect_err(|_| warn!("Device {}: usage count underflow", self.id().0))
    }

    /// Idle check entry point.
    ///
    /// With [`RpmFlags::GET_PUT`] a usage reference is dropped first and nothing else happens unless it was the
    /// last one.
    pub async fn idle(&'static self, flags: RpmFlags) -> Result<Outcome, Error> {
        if flags.contains(RpmFlags::GET_PUT) && !self.drop_reference()? {
            return Ok(Outcome::NoChange);
        }

        self.rpm_idle(flags).await
    }

    /// Suspend entry point.
    ///
    /// With [`RpmFlags::GET_PUT`] a usage reference is dropped first and nothing else happens unless it was the
    /// last one.
    pub async fn suspend(&'static self, flags: RpmFlags) -> Result<Outcome, Error> {
        if flags.contains(RpmFlags::GET_PUT) && !self.drop_reference()? {
            return Ok(Outcome::NoChange);
        }

        self.rpm_suspend(flags).await
    }

    /// Resume entry point, [`RpmFlags::GET_PUT`] takes a usage reference first
    pub async fn resume(&'static self, flags: RpmFlags) -> Result<Outcome, Error> {
        if flags.contains(RpmFlags::GET_PUT) {
            self.get_noresume();
        }

        self.rpm_resume(flags).await
    }

    /// Queue an idle check
    pub fn idle_async(&'static self) -> Result<Outcome, Error> {
        self.idle_nowait(RpmFlags::ASYNC)
    }

    /// Run an idle check, and suspend if the driver agrees
    pub async fn idle_sync(&'static self) -> Result<Outcome, Error> {
        self.rpm_idle(RpmFlags::empty()).await
    }

    /// Alias of [`Device::idle_async`]
    pub fn request_idle(&'static self) -> Result<Outcome, Error> {
        self.idle_async()
    }

    /// Queue a suspend
    pub fn suspend_async(&'static self) -> Result<Outcome, Error> {
        self.suspend_nowait(RpmFlags::ASYNC)
    }

    /// Suspend now
    pub async fn suspend_sync(&'static self) -> Result<Outcome, Error> {
        self.rpm_suspend(RpmFlags::empty()).await
    }

    /// Queue a suspend, or arm the autosuspend timer if the device was busy too recently
    pub fn autosuspend_async(&'static self) -> Result<Outcome, Error> {
        self.suspend_nowait(RpmFlags::ASYNC | RpmFlags::AUTO)
    }

    /// Suspend now, or arm the autosuspend timer if the device was busy too recently
    pub async fn autosuspend_sync(&'static self) -> Result<Outcome, Error> {
        self.rpm_suspend(RpmFlags::AUTO).await
    }

    /// Queue a resume
    pub fn resume_async(&'static self) -> Result<Outcome, Error> {
        self.resume_nowait(RpmFlags::ASYNC)
    }

    /// Resume now, along with any suspended ancestors
    pub async fn resume_sync(&'static self) -> Result<Outcome, Error> {
        self.rpm_resume(RpmFlags::empty()).await
    }

    /// Take a usage reference and queue a resume
    pub fn get(&'static self) -> Result<Outcome, Error> {
        self.get_noresume();
        self.resume_nowait(RpmFlags::ASYNC)
    }

    /// Take a usage reference and resume now.
    ///
    /// The reference is kept even if the resume fails.
    pub async fn get_sync(&'static self) -> Result<Outcome, Error> {
        self.resume(RpmFlags::GET_PUT).await
    }

    /// Take a usage reference and resume now, the reference is dropped again if the resume fails
    pub async fn resume_and_get(&'static self) -> Result<Outcome, Error> {
        let result = self.get_sync().await;
        if result.is_err() {
            self.put_noidle();
        }
        result
    }

    /// Take a usage reference if the device is active.
    ///
    /// Returns `Err(Error::Disabled)` if runtime PM is disabled and `Ok(false)` if the device is not active. With
    /// `ignore_usage` set a reference is taken even when nobody else holds one.
    pub fn get_if_active(&self, ignore_usage: bool) -> Result<bool, Error> {
        self.lock(|state| {
            if state.disable_depth > 0 {
                return Err(Error::Disabled);
            }

            if state.status != crate::RuntimeStatus::Active {
                return Ok(false);
            }

            if ignore_usage || state.usage_count > 0 {
                state.usage_count += 1;
                Ok(true)
            } else {
                Ok(false)
            }
        })
    }

    /// Take a usage reference if the device is active and already in use
    pub fn get_if_in_use(&self) -> Result<bool, Error> {
        self.get_if_active(false)
    }

    /// Drop a usage reference and queue an idle check if it was the last one
    pub fn put(&'static self) -> Result<Outcome, Error> {
        if !self.drop_reference()? {
            return Ok(Outcome::NoChange);
        }
        self.idle_nowait(RpmFlags::ASYNC)
    }

    /// Drop a usage reference and run an idle check now if it was the last one
    pub async fn put_sync(&'static self) -> Result<Outcome, Error> {
        self.idle(RpmFlags::GET_PUT).await
    }

    /// Drop a usage reference and queue an autosuspend if it was the last one
    pub fn put_autosuspend(&'static self) -> Result<Outcome, Error> {
        if !self.drop_reference()? {
            return Ok(Outcome::NoChange);
        }
        self.suspend_nowait(RpmFlags::ASYNC | RpmFlags::AUTO)
    }

    /// Drop a usage reference and autosuspend now if it was the last one
    pub async fn put_sync_autosuspend(&'static self) -> Result<Outcome, Error> {
        self.suspend(RpmFlags::GET_PUT | RpmFlags::AUTO).await
    }

    /// Drop a usage reference and suspend now if it was the last one
    pub async fn put_sync_suspend(&'static self) -> Result<Outcome, Error> {
        self.suspend(RpmFlags::GET_PUT).await
    }
}
