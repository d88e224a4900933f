//! Work queue and suspend timers
use core::cell::RefCell;

use embassy_sync::{blocking_mutex::Mutex, channel::Channel, signal::Signal};
use embassy_time::Instant;

use crate::{Device, GlobalRawMutex, error};

/// Runs deferred requests and suspend timers for devices
pub trait Scheduler: Sync {
    /// Queue a work item for `device`, whose [`Device::run_work`] then has to be called once.
    ///
    /// Returns false if the work could not be queued. Called with the device lock held: implementations must not
    /// call back into `device` or any other device from here, [`Device::run_work`] has to run later from another
    /// context.
    fn queue_work(&self, device: &'static Device) -> bool;

    /// Arm the suspend timer of `device`, replacing any timer armed for it before.
    ///
    /// [`Device::timer_expired`] has to be called once `expires` has passed. Timers are never cancelled, the device
    /// ignores timers it no longer wants. Called without the device lock held, so implementations may query the
    /// device.
    fn arm_timer(&self, device: &'static Device, expires: Instant);
}

/// Default [`Scheduler`] for up to `N` devices, driven by [`crate::task::worker`] and [`crate::task::timer`]
pub struct WorkQueue<const N: usize> {
    work: Channel<GlobalRawMutex, &'static Device, N>,
    timers: Mutex<GlobalRawMutex, RefCell<heapless::Vec<(&'static Device, Instant), N>>>,
    /// Wakes the timer task when a timer was armed
    timer_changed: Signal<GlobalRawMutex, ()>,
}

impl<const N: usize> WorkQueue<N> {
    /// Create a new work queue
    pub const fn new() -> Self {
        Self {
            work: Channel::new(),
            timers: Mutex::new(RefCell::new(heapless::Vec::new())),
            timer_changed: Signal::new(),
        }
    }

    /// Wait for the next device with queued work
    pub async fn next_work(&self) -> &'static Device {
        self.work.receive().await
    }

    /// Earliest armed timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .lock(|timers| timers.borrow().iter().map(|(_, expires)| *expires).min())
    }

    /// Wait until a timer is armed
    pub async fn timer_changed(&self) {
        self.timer_changed.wait().await;
    }

    /// Remove every timer that expired by `now` and hand it to its device
    pub fn fire_expired(&self, now: Instant) {
        // One at a time, devices may re-arm so the timer list must not be locked while they run. A device re-armed
        // for a time before `now` fires again, bounded by the number of timers.
        for _ in 0..N {
            let Some(device) = self.take_expired(now) else {
                break;
            };
            device.timer_expired();
        }
    }

    fn take_expired(&self, now: Instant) -> Option<&'static Device> {
        self.timers.lock(|timers| {
            let mut timers = timers.borrow_mut();
            let index = timers.iter().position(|(_, expires)| *expires <= now)?;
            Some(timers.swap_remove(index).0)
        })
    }
}

impl<const N: usize> Default for WorkQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Scheduler for WorkQueue<N> {
    fn queue_work(&self, device: &'static Device) -> bool {
        if self.work.try_send(device).is_err() {
            error!("Work queue full, dropping work for device {}", device.id().0);
            return false;
        }
        true
    }

    fn arm_timer(&self, device: &'static Device, expires: Instant) {
        self.timers.lock(|timers| {
            let mut timers = timers.borrow_mut();
            if let Some(timer) = timers.iter_mut().find(|(armed, _)| core::ptr::eq(*armed, device)) {
                timer.1 = expires;
            } else if timers.push((device, expires)).is_err() {
                error!("Timer list full, dropping timer for device {}", device.id().0);
            }
        });
        self.timer_changed.signal(());
    }
}
