//! Driver callbacks
//!
//! Devices never call into a driver directly. Each [`Provider`] is a deferred command channel: the runtime PM core
//! sends an [`Invocation`] and waits, while the driver side receives it in its own task, runs the callback and
//! responds. A device looks callbacks up across the providers registered at each [`Level`] and uses the first that
//! implements the operation.
//!
//! Up to [`MAX_NESTED_CALLBACKS`] invocations can be in flight on one provider, each with its own result slot, and
//! [`serve`] runs that many callbacks at once. A callback may therefore wait on runtime PM requests whose callbacks
//! are served by the same provider, such as an idle callback that suspends its device.
use bitflags::bitflags;
use embassy_futures::join::join_array;
use embassy_sync::{channel::Channel, signal::Signal};

use crate::{AtomicUsize, DeviceId, GlobalRawMutex, Ordering, debug, error};

/// Invocations that can be in flight on a single provider, and so how deeply callbacks may nest
pub const MAX_NESTED_CALLBACKS: usize = 4;

/// Callback kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Operation {
    /// Put the hardware into a low power state
    Suspend,
    /// Bring the hardware back up
    Resume,
    /// The device looks idle, the driver may veto suspending it
    Idle,
}

bitflags! {
    /// Set of callbacks a provider implements
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Operations: u8 {
        /// Implements [`Operation::Suspend`]
        const SUSPEND = 1 << 0;
        /// Implements [`Operation::Resume`]
        const RESUME = 1 << 1;
        /// Implements [`Operation::Idle`]
        const IDLE = 1 << 2;
    }
}

impl From<Operation> for Operations {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Suspend => Operations::SUSPEND,
            Operation::Resume => Operations::RESUME,
            Operation::Idle => Operations::IDLE,
        }
    }
}

/// Level a provider is registered at, in lookup order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Level {
    /// Power domain
    Domain,
    /// Device type
    Type,
    /// Device class
    Class,
    /// Bus
    Bus,
    /// The device's own driver
    Driver,
}

const LEVEL_COUNT: usize = 5;

/// Error returned by a driver callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CallbackError {
    /// The device can't change state right now, the request may be retried later.
    ///
    /// A busy suspend callback leaves no runtime error behind.
    Busy,
    /// Transient failure, treated like [`CallbackError::Busy`]
    TryAgain,
    /// Hard failure, runtime PM stops for the device until the error is cleared
    Failed,
}

/// Callback result
pub type CallbackResult = Result<(), CallbackError>;

/// A single callback invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Invocation {
    /// Device the callback is for
    pub device: DeviceId,
    /// Callback to run
    pub operation: Operation,
}

/// A unique identifier for a particular invocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct InvocationId(usize);

/// Where the result of an invocation goes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct Ticket {
    slot: usize,
    id: InvocationId,
}

/// Callback provider
pub struct Provider {
    level: Level,
    operations: Operations,
    /// Invocations waiting for the driver
    requests: Channel<GlobalRawMutex, (Invocation, Ticket), MAX_NESTED_CALLBACKS>,
    /// One result signal per in-flight invocation
    results: [Signal<GlobalRawMutex, (CallbackResult, InvocationId)>; MAX_NESTED_CALLBACKS],
    /// Result slots handed back after use
    free_slots: Channel<GlobalRawMutex, usize, MAX_NESTED_CALLBACKS>,
    /// Number of result slots handed out at least once
    used_slots: AtomicUsize,
    next_id: AtomicUsize,
}

impl Provider {
    /// Create a new provider implementing `operations`
    pub const fn new(level: Level, operations: Operations) -> Self {
        Self {
            level,
            operations,
            requests: Channel::new(),
            results: [const { Signal::new() }; MAX_NESTED_CALLBACKS],
            free_slots: Channel::new(),
            used_slots: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Level this provider is registered at
    pub fn level(&self) -> Level {
        self.level
    }

    /// Callbacks this provider implements
    pub fn operations(&self) -> Operations {
        self.operations
    }

    /// True if the provider implements `operation`
    pub fn provides(&self, operation: Operation) -> bool {
        self.operations.contains(operation.into())
    }

    fn next_invocation_id(&self) -> InvocationId {
        InvocationId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Take a result slot, waiting for one to be released if all are in use
    async fn acquire_slot(&self) -> SlotGuard<'_> {
        let slot = if let Ok(slot) = self.free_slots.try_receive() {
            slot
        } else {
            match self
                .used_slots
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                    (used < MAX_NESTED_CALLBACKS).then_some(used + 1)
                }) {
                Ok(slot) => slot,
                Err(_) => self.free_slots.receive().await,
            }
        };

        SlotGuard { provider: self, slot }
    }

    /// Run a callback on the driver side and wait for its result
    ///
    /// DROP SAFETY: The result slot is released on drop, a late result for the dropped invocation is discarded
    pub async fn invoke(&self, device: DeviceId, operation: Operation) -> CallbackResult {
        let guard = self.acquire_slot().await;
        let Some(result) = self.results.get(guard.slot) else {
            error!("Invalid callback result slot {}", guard.slot);
            return Err(CallbackError::Failed);
        };

        let ticket = Ticket {
            slot: guard.slot,
            id: self.next_invocation_id(),
        };
        result.reset();
        self.requests.send((Invocation { device, operation }, ticket)).await;
        loop {
            let (result, result_id) = result.wait().await;
            if result_id == ticket.id {
                return result;
            }

            debug!("Received callback result for different invocation: {}", result_id.0);
        }
    }

    /// Wait for the next invocation
    ///
    /// DROP SAFETY: Call to drop safe embassy primitive
    pub async fn receive(&self) -> CallbackRequest<'_> {
        let (invocation, ticket) = self.requests.receive().await;
        CallbackRequest {
            provider: self,
            ticket,
            invocation,
        }
    }
}

/// A result slot owned by an in-flight invocation
struct SlotGuard<'a> {
    provider: &'a Provider,
    slot: usize,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        // Never more slots than capacity
        if self.provider.free_slots.try_send(self.slot).is_err() {
            error!("Failed to release callback result slot {}", self.slot);
        }
    }
}

/// A callback waiting to be run by the driver
pub struct CallbackRequest<'a> {
    provider: &'a Provider,
    ticket: Ticket,
    /// What to run
    pub invocation: Invocation,
}

impl CallbackRequest<'_> {
    /// Report the callback result, consuming the request so each request is answered once
    pub fn respond(self, result: CallbackResult) {
        if let Some(slot) = self.provider.results.get(self.ticket.slot) {
            slot.signal((result, self.ticket.id));
        }
    }
}

/// Callbacks registered per level
#[derive(Clone, Copy, Default)]
pub(crate) struct CallbackTable {
    providers: [Option<&'static Provider>; LEVEL_COUNT],
}

impl CallbackTable {
    pub(crate) const fn new() -> Self {
        Self {
            providers: [None; LEVEL_COUNT],
        }
    }

    pub(crate) fn register(&mut self, provider: &'static Provider) {
        if let Some(slot) = self.providers.get_mut(provider.level() as usize) {
            *slot = Some(provider);
        }
    }

    /// First provider, in level order, that implements `operation`
    pub(crate) fn lookup(&self, operation: Operation) -> Option<&'static Provider> {
        self.providers
            .iter()
            .flatten()
            .copied()
            .find(|provider| provider.provides(operation))
    }
}

/// Driver side of the callbacks
///
/// Callbacks take `&self` since [`serve`] may run several of them at once.
pub trait RuntimeCallbacks {
    /// Put the device into a low power state
    fn runtime_suspend(&self, device: DeviceId) -> impl Future<Output = CallbackResult>;

    /// Bring the device back up
    fn runtime_resume(&self, device: DeviceId) -> impl Future<Output = CallbackResult>;

    /// The device looks idle. Returning an error keeps it from being suspended.
    ///
    /// The callback may itself suspend the device, synchronously or not.
    fn runtime_idle(&self, _device: DeviceId) -> impl Future<Output = CallbackResult> {
        core::future::ready(Ok(()))
    }
}

/// Wait for a single invocation on `provider` and run it on `callbacks`
pub async fn process(provider: &Provider, callbacks: &impl RuntimeCallbacks) {
    let request = provider.receive().await;
    let Invocation { device, operation } = request.invocation;
    let result = match operation {
        Operation::Suspend => callbacks.runtime_suspend(device).await,
        Operation::Resume => callbacks.runtime_resume(device).await,
        Operation::Idle => callbacks.runtime_idle(device).await,
    };
    request.respond(result);
}

async fn worker(provider: &Provider, callbacks: &impl RuntimeCallbacks) {
    loop {
        process(provider, callbacks).await;
    }
}

/// Serve every invocation on `provider`, running up to [`MAX_NESTED_CALLBACKS`] callbacks at once
pub async fn serve(provider: &Provider, callbacks: &impl RuntimeCallbacks) {
    let workers: [_; MAX_NESTED_CALLBACKS] = core::array::from_fn(|_| worker(provider, callbacks));
    join_array(workers).await;
}
