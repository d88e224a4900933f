//! Device record and per-device state
use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::waitqueue::MultiWakerRegistration;
use embassy_time::{Duration, Instant};

use crate::callback::{CallbackError, CallbackResult, CallbackTable, Operation, Provider};
use crate::config::Config;
use crate::queue::Scheduler;
use crate::{DeviceId, GlobalRawMutex, trace};

/// Number of tasks that can wait on a single device at once.
///
/// Registering more waiters wakes the existing ones, which then simply re-register.
const MAX_WAITERS: usize = 4;

/// Runtime power status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RuntimeStatus {
    /// Fully powered and usable
    Active,
    /// Resume callback in progress
    Resuming,
    /// Low power, not usable until resumed
    Suspended,
    /// Suspend callback in progress
    Suspending,
}

/// Request waiting for the work queue
///
/// Ordered by precedence: a pending request is never replaced by an idle request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Request {
    /// Nothing to do
    #[default]
    None,
    /// Run the idle check
    Idle,
    /// Suspend now
    Suspend,
    /// Suspend once the autosuspend delay has passed
    Autosuspend,
    /// Resume
    Resume,
}

/// Mutable runtime PM state, only ever touched with the device lock held
pub(crate) struct State {
    pub(crate) status: RuntimeStatus,
    /// Status captured when runtime PM was disabled
    pub(crate) last_status: Option<RuntimeStatus>,
    pub(crate) usage_count: i32,
    pub(crate) child_count: u32,
    pub(crate) disable_depth: u32,
    pub(crate) ignore_children: bool,
    pub(crate) irq_safe: bool,
    /// Cleared by [`Device::forbid`]
    pub(crate) runtime_auto: bool,
    pub(crate) no_callbacks: bool,
    pub(crate) request_pending: bool,
    pub(crate) request: Request,
    pub(crate) deferred_resume: bool,
    pub(crate) runtime_error: Option<CallbackError>,
    pub(crate) idle_notification: bool,
    /// A work item for this device sits in the scheduler
    pub(crate) work_queued: bool,
    /// The work queue is currently running a request for this device
    pub(crate) work_running: bool,
    pub(crate) timer_expires: Option<Instant>,
    pub(crate) timer_autosuspends: bool,
    pub(crate) last_busy: Instant,
    pub(crate) autosuspend_delay_ms: i32,
    pub(crate) use_autosuspend: bool,
    pub(crate) resume_latency: Option<Duration>,
    pub(crate) accounting_timestamp: Instant,
    pub(crate) active_time: Duration,
    pub(crate) suspended_time: Duration,
    waiters: MultiWakerRegistration<MAX_WAITERS>,
}

impl State {
    /// Initial state: suspended, runtime PM disabled once
    pub(crate) fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            status: RuntimeStatus::Suspended,
            last_status: None,
            usage_count: 0,
            child_count: 0,
            disable_depth: 1,
            ignore_children: config.ignore_children,
            irq_safe: false,
            runtime_auto: true,
            no_callbacks: config.no_callbacks,
            request_pending: false,
            request: Request::None,
            deferred_resume: false,
            runtime_error: None,
            idle_notification: false,
            work_queued: false,
            work_running: false,
            timer_expires: None,
            timer_autosuspends: false,
            last_busy: now,
            autosuspend_delay_ms: config.autosuspend_delay_ms,
            use_autosuspend: config.use_autosuspend,
            resume_latency: None,
            accounting_timestamp: now,
            active_time: Duration::from_ticks(0),
            suspended_time: Duration::from_ticks(0),
            waiters: MultiWakerRegistration::new(),
        }
    }

    /// Charge the time since the last status change to the current status
    pub(crate) fn update_accounting(&mut self, now: Instant) {
        if self.disable_depth > 0 {
            return;
        }

        let delta = now
            .checked_duration_since(self.accounting_timestamp)
            .unwrap_or(Duration::from_ticks(0));
        self.accounting_timestamp = now;

        if self.status == RuntimeStatus::Suspended {
            self.suspended_time += delta;
        } else {
            self.active_time += delta;
        }
    }

    pub(crate) fn update_status(&mut self, status: RuntimeStatus, now: Instant) {
        self.update_accounting(now);
        self.status = status;
    }

    pub(crate) fn in_transition(&self) -> bool {
        matches!(self.status, RuntimeStatus::Resuming | RuntimeStatus::Suspending)
    }

    pub(crate) fn deactivate_timer(&mut self) {
        self.timer_expires = None;
        self.timer_autosuspends = false;
    }

    /// Drop the armed timer and whatever request is waiting for the work queue
    pub(crate) fn cancel_pending(&mut self) {
        self.deactivate_timer();
        self.request = Request::None;
    }

    /// Drop one usage reference, returns the remaining count
    pub(crate) fn drop_usage(&mut self) -> Result<i32, crate::Error> {
        if self.usage_count <= 0 {
            return Err(crate::Error::UsageUnderflow);
        }

        self.usage_count -= 1;
        Ok(self.usage_count)
    }

    pub(crate) fn wake_all(&mut self) {
        self.waiters.wake();
    }
}

/// A device under runtime power management
pub struct Device {
    id: DeviceId,
    parent: Option<&'static Device>,
    callbacks: CallbackTable,
    scheduler: &'static dyn Scheduler,
    state: Mutex<GlobalRawMutex, RefCell<State>>,
}

impl Device {
    /// Create a new device.
    ///
    /// The device starts out suspended with runtime PM disabled. Set the initial status with
    /// [`Device::set_active`] or [`Device::set_suspended`], then call [`Device::enable`].
    pub fn new(id: DeviceId, scheduler: &'static dyn Scheduler, config: Config) -> Self {
        Self {
            id,
            parent: None,
            callbacks: CallbackTable::new(),
            scheduler,
            state: Mutex::new(RefCell::new(State::new(config))),
        }
    }

    /// Builder method to attach the device to its parent
    pub fn with_parent(mut self, parent: &'static Device) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Builder method to register a callback provider.
    ///
    /// A provider replaces any provider previously registered at the same level.
    pub fn with_provider(mut self, provider: &'static Provider) -> Self {
        self.callbacks.register(provider);
        self
    }

    /// Device ID
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Parent device, if any
    pub fn parent(&self) -> Option<&'static Device> {
        self.parent
    }

    pub(crate) fn scheduler(&self) -> &'static dyn Scheduler {
        self.scheduler
    }

    /// Run `f` with the device lock held.
    ///
    /// A parent's lock may be taken while the child's is held, never the other way around.
    pub(crate) fn lock<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }

    /// Sleep until `done` holds.
    ///
    /// The condition is checked and the waker registered under the same lock, so a wake between the two can't be
    /// lost.
    pub(crate) async fn wait_until(&self, done: impl Fn(&State) -> bool) {
        poll_fn(|cx| {
            self.lock(|state| {
                if done(state) {
                    Poll::Ready(())
                } else {
                    state.waiters.register(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }

    /// Run the first registered callback for `operation`, a missing callback counts as success
    pub(crate) async fn run_callback(&self, operation: Operation) -> CallbackResult {
        match self.callbacks.lookup(operation) {
            Some(provider) => provider.invoke(self.id, operation).await,
            None => {
                trace!("Device {}: no {:?} callback", self.id.0, operation);
                Ok(())
            }
        }
    }

    pub(crate) fn has_callback(&self, operation: Operation) -> bool {
        self.callbacks.lookup(operation).is_some()
    }

    /// Current runtime status
    pub fn status(&self) -> RuntimeStatus {
        self.lock(|state| state.status)
    }

    /// Current usage count
    pub fn usage_count(&self) -> i32 {
        self.lock(|state| state.usage_count)
    }

    /// Number of active children
    pub fn child_count(&self) -> u32 {
        self.lock(|state| state.child_count)
    }

    /// Runtime PM disable depth, zero when enabled
    pub fn disable_depth(&self) -> u32 {
        self.lock(|state| state.disable_depth)
    }

    /// True if runtime PM is enabled
    pub fn enabled(&self) -> bool {
        self.disable_depth() == 0
    }

    /// True if the device is active, or runtime PM is disabled
    pub fn active(&self) -> bool {
        self.lock(|state| state.disable_depth > 0 || state.status == RuntimeStatus::Active)
    }

    /// True if runtime PM is enabled and the device is suspended
    pub fn suspended(&self) -> bool {
        self.lock(|state| state.disable_depth == 0 && state.status == RuntimeStatus::Suspended)
    }

    /// True if the status is suspended, whether runtime PM is enabled or not
    pub fn status_suspended(&self) -> bool {
        self.status() == RuntimeStatus::Suspended
    }

    /// Error left behind by the last failed callback
    pub fn runtime_error(&self) -> Option<CallbackError> {
        self.lock(|state| state.runtime_error)
    }

    /// Request waiting for the work queue, if any
    pub fn pending_request(&self) -> Option<Request> {
        self.lock(|state| {
            if state.request_pending && state.request != Request::None {
                Some(state.request)
            } else {
                None
            }
        })
    }

    /// Expiry of the armed suspend timer
    pub fn timer_expires(&self) -> Option<Instant> {
        self.lock(|state| state.timer_expires)
    }

    /// True if the device was marked irq-safe
    pub fn is_irq_safe(&self) -> bool {
        self.lock(|state| state.irq_safe)
    }

    /// True if the device was marked as having no callbacks
    pub fn has_no_callbacks(&self) -> bool {
        self.lock(|state| state.no_callbacks)
    }

    /// True unless runtime PM was forbidden for the device
    pub fn runtime_allowed(&self) -> bool {
        self.lock(|state| state.runtime_auto)
    }

    /// Time spent active (or transitioning) while runtime PM was enabled
    pub fn active_time(&self) -> Duration {
        self.lock(|state| {
            state.update_accounting(Instant::now());
            state.active_time
        })
    }

    /// Time spent suspended while runtime PM was enabled
    pub fn suspended_time(&self) -> Duration {
        self.lock(|state| {
            state.update_accounting(Instant::now());
            state.suspended_time
        })
    }
}
