//! Configuration types for runtime PM devices

/// Initial runtime PM configuration of a device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Autosuspend delay in milliseconds.
    ///
    /// A negative delay prevents runtime suspend for as long as autosuspend is in use.
    pub autosuspend_delay_ms: i32,
    /// Whether suspend requests with [`crate::RpmFlags::AUTO`] honour the autosuspend delay
    pub use_autosuspend: bool,
    /// Active children never keep this device active
    pub ignore_children: bool,
    /// The device has no callbacks, transitions only update bookkeeping
    pub no_callbacks: bool,
}

impl Config {
    /// Builder method to enable autosuspend with the given delay
    pub fn with_autosuspend(mut self, delay_ms: i32) -> Self {
        self.use_autosuspend = true;
        self.autosuspend_delay_ms = delay_ms;
        self
    }

    /// Builder method to ignore children
    pub fn with_ignore_children(mut self) -> Self {
        self.ignore_children = true;
        self
    }

    /// Builder method to mark the device as having no callbacks
    pub fn with_no_callbacks(mut self) -> Self {
        self.no_callbacks = true;
        self
    }
}
