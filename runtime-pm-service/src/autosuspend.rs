//! Autosuspend and suspend timers
use embassy_time::{Duration, Instant};

use crate::device::State;
use crate::policy::{self, Allowed};
use crate::{Device, Error, Outcome, RpmFlags, debug, trace};

/// Delays of at least this long are rounded up to a whole second so timers for different devices tend to coincide
const ROUNDING_THRESHOLD_MS: u64 = 1000;

/// When an autosuspend may happen, `None` if that is already the case or autosuspend is not in use
pub(crate) fn expiration(state: &State, now: Instant) -> Option<Instant> {
    if !state.use_autosuspend {
        return None;
    }

    // Negative delays never expire
    let delay_ms = u64::try_from(state.autosuspend_delay_ms).ok()?;
    let mut expires = state.last_busy.checked_add(Duration::from_millis(delay_ms))?;
    if delay_ms >= ROUNDING_THRESHOLD_MS {
        expires = round_up_to_second(expires);
    }

    (expires > now).then_some(expires)
}

fn round_up_to_second(instant: Instant) -> Instant {
    let remainder = instant.as_millis() % 1000;
    if remainder == 0 {
        instant
    } else {
        Instant::from_millis(instant.as_millis() - remainder + 1000)
    }
}

/// What an expired timer leads to
enum Expired {
    Suspend(RpmFlags),
    /// The timer moved to a later expiration
    Rearm(Instant),
    /// The timer was deactivated
    Stale,
}

/// How the usage count changes when the autosuspend settings change
enum Update {
    /// A negative delay now blocks runtime suspend, a usage reference was taken for it
    Prevent,
    /// The block was lifted or never existed
    Allow,
    /// Still blocked, nothing to do
    Unchanged,
}

impl Device {
    /// Record the current time as the last time the device was busy
    pub fn mark_last_busy(&self) {
        let now = Instant::now();
        self.lock(|state| state.last_busy = now);
    }

    /// Last time the device was marked busy
    pub fn last_busy(&self) -> Instant {
        self.lock(|state| state.last_busy)
    }

    /// Current autosuspend delay in milliseconds
    pub fn autosuspend_delay(&self) -> i32 {
        self.lock(|state| state.autosuspend_delay_ms)
    }

    /// True if autosuspend is in use
    pub fn uses_autosuspend(&self) -> bool {
        self.lock(|state| state.use_autosuspend)
    }

    /// When the device may autosuspend, `None` if it may do so right now or autosuspend is not in use
    pub fn autosuspend_expiration(&self) -> Option<Instant> {
        let now = Instant::now();
        self.lock(|state| expiration(state, now))
    }

    /// Change the autosuspend delay
    pub async fn set_autosuspend_delay(&'static self, delay_ms: i32) {
        self.configure_autosuspend(Some(delay_ms), None).await;
    }

    /// Start or stop using autosuspend
    pub async fn use_autosuspend(&'static self, enable: bool) {
        self.configure_autosuspend(None, Some(enable)).await;
    }

    /// Change the autosuspend delay and whether autosuspend is in use in one step.
    ///
    /// The previous settings are captured once, so changing both at the same time takes or drops the usage
    /// reference for a negative delay exactly once.
    pub async fn configure_autosuspend(&'static self, delay_ms: Option<i32>, enable: Option<bool>) {
        let update = self.lock(|state| {
            let old_delay = state.autosuspend_delay_ms;
            let old_use = state.use_autosuspend;
            if let Some(delay_ms) = delay_ms {
                state.autosuspend_delay_ms = delay_ms;
            }
            if let Some(enable) = enable {
                state.use_autosuspend = enable;
            }

            let was_blocked = old_use && old_delay < 0;
            if state.use_autosuspend && state.autosuspend_delay_ms < 0 {
                if was_blocked {
                    Update::Unchanged
                } else {
                    state.usage_count += 1;
                    Update::Prevent
                }
            } else {
                if was_blocked {
                    state.usage_count -= 1;
                }
                Update::Allow
            }
        });

        let result = match update {
            Update::Prevent => self.rpm_resume(RpmFlags::empty()).await,
            Update::Allow => self.rpm_idle(RpmFlags::AUTO).await,
            Update::Unchanged => Ok(Outcome::NoChange),
        };

        if let Err(e) = result {
            trace!("Device {}: autosuspend update: {:?}", self.id().0, e);
        }
    }

    /// Suspend after `delay`, replacing any armed timer
    pub fn schedule_suspend(&'static self, delay: Duration) -> Result<Outcome, Error> {
        if delay == Duration::from_ticks(0) {
            return self.suspend_nowait(RpmFlags::ASYNC);
        }

        let now = Instant::now();
        let expires = self.lock(|state| {
            match policy::evaluate(state) {
                Ok(Allowed::Proceed) => {}
                Ok(Allowed::AlreadySuspended) => return Ok(None),
                Err(deny) => return Err(Error::from(deny)),
            }

            state.cancel_pending();
            let expires = now.checked_add(delay).unwrap_or(Instant::MAX);
            state.timer_expires = Some(expires);
            Ok(Some(expires))
        })?;

        match expires {
            Some(expires) => {
                self.scheduler().arm_timer(self, expires);
                Ok(Outcome::Scheduled)
            }
            None => Ok(Outcome::NoChange),
        }
    }

    /// Handle an expired suspend timer.
    ///
    /// Timers are cancelled lazily: the scheduler may fire for a timer that was since deactivated or moved, which is
    /// ignored or re-armed here.
    pub fn timer_expired(&'static self) {
        let now = Instant::now();
        let expired = self.lock(|state| match state.timer_expires {
            Some(expires) if expires <= now => {
                state.timer_expires = None;
                Expired::Suspend(if state.timer_autosuspends {
                    RpmFlags::ASYNC | RpmFlags::AUTO
                } else {
                    RpmFlags::ASYNC
                })
            }
            Some(expires) => Expired::Rearm(expires),
            None => Expired::Stale,
        });

        match expired {
            Expired::Suspend(flags) => {
                if let Err(e) = self.suspend_nowait(flags) {
                    debug!("Device {}: timer suspend: {:?}", self.id().0, e);
                }
            }
            Expired::Rearm(expires) => self.scheduler().arm_timer(self, expires),
            Expired::Stale => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::callback::Operation;
    use crate::config::Config;
    use crate::device::{Request, RuntimeStatus};
    use crate::queue::Scheduler;
    use crate::test::{Fixture, leak};
    use crate::DeviceId;
    use rstest::rstest;
    use std::sync::Mutex;
    use std::vec::Vec;

    /// Scheduler that looks at the device while arming its timer
    #[derive(Default)]
    struct InspectingScheduler {
        armed: Mutex<Vec<(Instant, Option<Instant>)>>,
    }

    impl Scheduler for InspectingScheduler {
        fn queue_work(&self, _device: &'static Device) -> bool {
            true
        }

        fn arm_timer(&self, device: &'static Device, expires: Instant) {
            let seen = device.timer_expires();
            self.armed.lock().unwrap().push((expires, seen));
        }
    }

    #[rstest]
    #[case::disabled(false, 100, 0, None)]
    #[case::negative(true, -1, 0, None)]
    #[case::pending(true, 100, 50, Some(100))]
    #[case::elapsed(true, 100, 100, None)]
    #[case::zero(true, 0, 0, None)]
    #[case::rounded(true, 1500, 0, Some(2000))]
    #[case::whole_second(true, 2000, 0, Some(2000))]
    fn test_expiration(
        #[case] use_autosuspend: bool,
        #[case] delay_ms: i32,
        #[case] now_ms: u64,
        #[case] expected_ms: Option<u64>,
    ) {
        let mut state = State::new(Config::default());
        state.use_autosuspend = use_autosuspend;
        state.autosuspend_delay_ms = delay_ms;
        state.last_busy = Instant::from_millis(0);

        assert_eq!(
            expiration(&state, Instant::from_millis(now_ms)),
            expected_ms.map(Instant::from_millis)
        );
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up_to_second(Instant::from_millis(1001)), Instant::from_millis(2000));
        assert_eq!(round_up_to_second(Instant::from_millis(3000)), Instant::from_millis(3000));
    }

    #[tokio::test]
    async fn test_autosuspend_scheduled() {
        let fixture = Fixture::new();
        let device = fixture.active_device(0, Config::default().with_autosuspend(100));

        device.mark_last_busy();
        assert_eq!(device.autosuspend_async(), Ok(Outcome::Scheduled));
        let expires = device.timer_expires().unwrap();
        assert_eq!(fixture.scheduler.armed(device), Some(expires));
        assert_eq!(device.status(), RuntimeStatus::Active);

        // A later request never pushes the timer out
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        device.mark_last_busy();
        assert_eq!(device.autosuspend_async(), Ok(Outcome::Scheduled));
        assert_eq!(device.timer_expires(), Some(expires));
    }

    #[tokio::test]
    async fn test_autosuspend_elapsed() {
        let fixture = Fixture::new();
        let device = fixture.active_device(0, Config::default().with_autosuspend(0));

        assert_eq!(device.autosuspend_sync().await, Ok(Outcome::Completed));
        assert_eq!(device.status(), RuntimeStatus::Suspended);
        assert_eq!(fixture.journal.count(device.id(), Operation::Suspend), 1);
    }

    #[tokio::test]
    async fn test_timer_fires() {
        let fixture = Fixture::new();
        let device = fixture.active_device(0, Config::default().with_autosuspend(30));

        device.mark_last_busy();
        assert_eq!(device.autosuspend_async(), Ok(Outcome::Scheduled));

        // Too early, the timer is re-armed
        device.timer_expired();
        assert!(device.timer_expires().is_some());
        assert_eq!(fixture.scheduler.queued(), 0);

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        fixture.scheduler.fire_timers();
        assert_eq!(device.timer_expires(), None);
        assert_eq!(device.pending_request(), Some(Request::Autosuspend));

        fixture.scheduler.run_pending().await;
        assert_eq!(device.status(), RuntimeStatus::Suspended);
    }

    #[tokio::test]
    async fn test_busy_again_before_timer() {
        let fixture = Fixture::new();
        let device = fixture.active_device(0, Config::default().with_autosuspend(100));

        device.mark_last_busy();
        assert_eq!(device.autosuspend_async(), Ok(Outcome::Scheduled));

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        device.mark_last_busy();
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        // The timer fires on schedule but the device was busy since, so the suspend is pushed out
        fixture.scheduler.fire_timers();
        assert_eq!(device.status(), RuntimeStatus::Active);
        assert!(device.timer_expires().is_some());
        assert_eq!(fixture.scheduler.queued(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_timer_ignored() {
        let fixture = Fixture::new();
        let device = fixture.active_device(0, Config::default().with_autosuspend(10));

        device.mark_last_busy();
        assert_eq!(device.autosuspend_async(), Ok(Outcome::Scheduled));
        device.get_noresume();
        // Resuming an active device cancels a plain timer but an autosuspend timer survives
        assert_eq!(device.resume_sync().await, Ok(Outcome::NoChange));
        assert!(device.timer_expires().is_some());

        assert!(!device.barrier().await);
        assert_eq!(device.timer_expires(), None);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        fixture.scheduler.fire_timers();
        assert_eq!(fixture.scheduler.queued(), 0);
        assert_eq!(device.status(), RuntimeStatus::Active);
    }

    #[tokio::test]
    async fn test_schedule_suspend() {
        let fixture = Fixture::new();
        let device = fixture.active_device(0, Config::default());

        assert_eq!(device.schedule_suspend(Duration::from_millis(20)), Ok(Outcome::Scheduled));
        assert!(fixture.scheduler.armed(device).is_some());

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        fixture.scheduler.fire_timers();
        assert_eq!(device.pending_request(), Some(Request::Suspend));
        fixture.scheduler.run_pending().await;
        assert_eq!(device.status(), RuntimeStatus::Suspended);
    }

    #[tokio::test]
    async fn test_schedule_suspend_refused() {
        let fixture = Fixture::new();
        let device = fixture.active_device(0, Config::default());
        device.get_noresume();

        assert_eq!(device.schedule_suspend(Duration::from_millis(20)), Err(Error::Busy));
        assert_eq!(device.timer_expires(), None);
    }

    #[tokio::test]
    async fn test_negative_delay_blocks_suspend() {
        let fixture = Fixture::new();
        let device = fixture.active_device(0, Config::default());

        device.use_autosuspend(true).await;
        device.set_autosuspend_delay(-1).await;
        assert_eq!(device.usage_count(), 1);
        assert_eq!(device.autosuspend_sync().await, Err(Error::Busy));

        // Still negative, no second reference
        device.set_autosuspend_delay(-5).await;
        assert_eq!(device.usage_count(), 1);

        device.set_autosuspend_delay(0).await;
        assert_eq!(device.usage_count(), 0);
        assert_eq!(device.status(), RuntimeStatus::Suspended);
    }

    #[tokio::test]
    async fn test_negative_delay_resumes() {
        let fixture = Fixture::new();
        let device = fixture.device(0, Config::default().with_autosuspend(1000));
        device.enable();

        device.configure_autosuspend(Some(-1), Some(true)).await;
        assert_eq!(device.usage_count(), 1);
        assert_eq!(device.status(), RuntimeStatus::Active);

        device.use_autosuspend(false).await;
        assert_eq!(device.usage_count(), 0);
    }

    #[tokio::test]
    async fn test_arm_timer_may_query_device() {
        let fixture = Fixture::new();
        let scheduler = leak(InspectingScheduler::default());
        let device = leak(
            Device::new(DeviceId(0), scheduler, Config::default().with_autosuspend(30))
                .with_provider(fixture.provider),
        );
        device.set_active().unwrap();
        device.enable();

        device.mark_last_busy();
        assert_eq!(device.autosuspend_async(), Ok(Outcome::Scheduled));
        // Too early, re-armed
        device.timer_expired();
        assert_eq!(device.schedule_suspend(Duration::from_millis(50)), Ok(Outcome::Scheduled));

        let armed = scheduler.armed.lock().unwrap().clone();
        assert_eq!(armed.len(), 3);
        for (expires, seen) in armed {
            assert_eq!(seen, Some(expires));
        }
    }
}
