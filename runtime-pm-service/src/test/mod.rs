//! Test fixtures
#![allow(clippy::unwrap_used)]

use std::boxed::Box;

use crate::callback::{Level, Operations, Provider};
use crate::{Config, Device, DeviceId};

mod mock;

pub(crate) use mock::{Call, Journal, ManualScheduler};

/// Leak a value to get a `'static` reference, devices and providers live for the whole test
pub(crate) fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// A manual scheduler plus a driver-level provider served by a mock driver
pub(crate) struct Fixture {
    pub scheduler: &'static ManualScheduler,
    pub provider: &'static Provider,
    pub journal: &'static Journal,
}

impl Fixture {
    /// Must be called from within a tokio runtime
    pub fn new() -> Self {
        let fixture = Self {
            scheduler: leak(ManualScheduler::default()),
            provider: leak(Provider::new(Level::Driver, Operations::all())),
            journal: leak(Journal::default()),
        };
        fixture.serve(fixture.provider);
        fixture
    }

    /// Answer invocations on `provider` with the mock driver
    pub fn serve(&self, provider: &'static Provider) {
        mock::serve(provider, self.journal);
    }

    /// Suspended device with runtime PM disabled
    pub fn device(&self, id: u8, config: Config) -> &'static Device {
        leak(Device::new(DeviceId(id), self.scheduler, config).with_provider(self.provider))
    }

    /// Suspended child device with runtime PM disabled
    pub fn child(&self, id: u8, parent: &'static Device, config: Config) -> &'static Device {
        leak(
            Device::new(DeviceId(id), self.scheduler, config)
                .with_parent(parent)
                .with_provider(self.provider),
        )
    }

    /// Active device with runtime PM enabled
    pub fn active_device(&self, id: u8, config: Config) -> &'static Device {
        let device = self.device(id, config);
        device.set_active().unwrap();
        device.enable();
        device
    }

    /// Active child device with runtime PM enabled, the parent has to be active
    pub fn active_child(&self, id: u8, parent: &'static Device, config: Config) -> &'static Device {
        let device = self.child(id, parent, config);
        device.set_active().unwrap();
        device.enable();
        device
    }
}
