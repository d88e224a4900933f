//! Request flags

use bitflags::bitflags;

bitflags! {
    /// Flags that modify how an idle, suspend or resume request is carried out
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RpmFlags: u8 {
        /// Hand the request to the work queue instead of running it in the caller
        const ASYNC = 1 << 0;
        /// Do not wait for a transition that is already running
        const NOWAIT = 1 << 1;
        /// Increment (resume) or decrement (idle, suspend) the usage count first
        const GET_PUT = 1 << 2;
        /// Respect the autosuspend delay
        const AUTO = 1 << 3;
    }
}

impl RpmFlags {
    /// True if the caller does not want to wait for a transition that is already running
    pub fn no_wait(self) -> bool {
        self.intersects(Self::ASYNC | Self::NOWAIT)
    }
}
