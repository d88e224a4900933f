//! Mock scheduler and driver
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::vec::Vec;

use embassy_time::Instant;

use crate::callback::{self, CallbackError, CallbackResult, Operation, Provider, RuntimeCallbacks};
use crate::queue::Scheduler;
use crate::{Device, DeviceId};

/// A callback that ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Call {
    pub device: DeviceId,
    pub operation: Operation,
}

impl Call {
    pub fn new(device: DeviceId, operation: Operation) -> Self {
        Self { device, operation }
    }
}

/// Scheduler that only runs work and timers when a test asks it to
#[derive(Default)]
pub(crate) struct ManualScheduler {
    work: Mutex<VecDeque<&'static Device>>,
    timers: Mutex<Vec<(&'static Device, Instant)>>,
    refuse: AtomicBool,
}

impl ManualScheduler {
    /// Number of queued work items
    pub fn queued(&self) -> usize {
        self.work.lock().unwrap().len()
    }

    /// Run the work items queued so far, items queued while running stay queued
    pub async fn run_pending(&self) {
        for _ in 0..self.queued() {
            let next = self.work.lock().unwrap().pop_front();
            if let Some(device) = next {
                device.run_work().await;
            }
        }
    }

    /// Timer armed for `device`
    pub fn armed(&self, device: &'static Device) -> Option<Instant> {
        self.timers
            .lock()
            .unwrap()
            .iter()
            .find(|(armed, _)| core::ptr::eq(*armed, device))
            .map(|(_, expires)| *expires)
    }

    /// Fire every timer that expired by now
    pub fn fire_timers(&self) {
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut timers = self.timers.lock().unwrap();
            let (expired, armed) = timers.drain(..).partition(|(_, expires)| *expires <= now);
            *timers = armed;
            expired
        };

        for (device, _) in expired {
            device.timer_expired();
        }
    }

    /// Make [`Scheduler::queue_work`] fail
    pub fn refuse_work(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl Scheduler for ManualScheduler {
    fn queue_work(&self, device: &'static Device) -> bool {
        if self.refuse.load(Ordering::SeqCst) {
            return false;
        }

        self.work.lock().unwrap().push_back(device);
        true
    }

    fn arm_timer(&self, device: &'static Device, expires: Instant) {
        let mut timers = self.timers.lock().unwrap();
        timers.retain(|(armed, _)| !core::ptr::eq(*armed, device));
        timers.push((device, expires));
    }
}

/// Record of callbacks plus failures and delays to inject
#[derive(Default)]
pub(crate) struct Journal {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<Vec<(Call, CallbackError)>>,
    delay: Mutex<Option<std::time::Duration>>,
}

impl Journal {
    /// Every callback so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of times `operation` ran for `device`
    pub fn count(&self, device: DeviceId, operation: Operation) -> usize {
        let call = Call::new(device, operation);
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    /// Fail the next `operation` callback for `device`
    pub fn fail_next(&self, device: DeviceId, operation: Operation, error: CallbackError) {
        self.failures.lock().unwrap().push((Call::new(device, operation), error));
    }

    /// Make every callback take `delay`
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    async fn run(&self, call: Call) -> CallbackResult {
        self.calls.lock().unwrap().push(call);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut failures = self.failures.lock().unwrap();
        match failures.iter().position(|(failing, _)| *failing == call) {
            Some(index) => Err(failures.remove(index).1),
            None => Ok(()),
        }
    }
}

/// Driver backed by a journal
struct MockDriver {
    journal: &'static Journal,
}

impl RuntimeCallbacks for MockDriver {
    async fn runtime_suspend(&self, device: DeviceId) -> CallbackResult {
        self.journal.run(Call::new(device, Operation::Suspend)).await
    }

    async fn runtime_resume(&self, device: DeviceId) -> CallbackResult {
        self.journal.run(Call::new(device, Operation::Resume)).await
    }

    async fn runtime_idle(&self, device: DeviceId) -> CallbackResult {
        self.journal.run(Call::new(device, Operation::Idle)).await
    }
}

/// Spawn a task answering invocations on `provider`
pub(crate) fn serve(provider: &'static Provider, journal: &'static Journal) {
    tokio::spawn(async move {
        let driver = MockDriver { journal };
        callback::serve(provider, &driver).await;
    });
}
