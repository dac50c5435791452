//! Live, invalidatable cells holding resolved symbol addresses.
//!
//! A [`FunctionDescriptor`] is handed out as an `Arc` by the registry and is
//! read on every call. The registry rewrites it in place when a reload maps
//! the symbol to a new library and zeroes it when the owning library is
//! unloaded, so every holder observes the change without re-fetching.
//!
//! The address lives in an atomic slot, so a reader never sees a torn value.
//! A caller may additionally [`pin`] the address for the duration of a call:
//! invalidation waits until every pinned call has returned. Once invalidation
//! has started, new pins are refused instead of queueing behind it, so a
//! pinned caller can re-enter the registry, or pin the same descriptor again,
//! without waiting on itself.
//!
//! [`pin`]: FunctionDescriptor::pin

use std::{
    num::NonZeroUsize,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

#[derive(Debug, Default)]
struct Pins {
    active: usize,
    retiring: bool,
}

/// A resolved symbol address plus the bookkeeping for pinned calls.
///
/// An address of `0` means "not resolved" or "invalidated"; every accessor
/// except [`raw`](Self::raw) maps it to `None`.
#[derive(Debug, Default)]
pub struct FunctionDescriptor {
    address: AtomicUsize,
    pins: Mutex<Pins>,
    released: Condvar,
}

impl FunctionDescriptor {
    #[must_use]
    pub fn new(address: NonZeroUsize) -> Self {
        Self {
            address: AtomicUsize::new(address.get()),
            ..Self::default()
        }
    }

    pub fn address(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.address.load(Ordering::Acquire))
    }

    pub fn is_valid(&self) -> bool {
        self.address().is_some()
    }

    /// Unguarded read of the slot, `0` when invalid.
    ///
    /// Suitable for callers that have opted out of checking; the value may be
    /// invalidated the moment after it is read.
    pub fn raw(&self) -> usize {
        self.address.load(Ordering::Acquire)
    }

    /// Yields the address and keeps the owning library mapped until the
    /// returned [`PinnedAddress`] is dropped.
    ///
    /// Returns `None` if the descriptor is invalid or being invalidated.
    /// Never blocks: a caller refused here should look the function up
    /// again, since the registry already points past the retiring library.
    ///
    /// Unloading the pinned library from the thread holding the pin waits
    /// forever.
    pub fn pin(self: &Arc<Self>) -> Option<PinnedAddress> {
        let mut pins = self.lock_pins();
        if pins.retiring {
            return None;
        }
        let address = self.address()?;
        pins.active += 1;
        Some(PinnedAddress {
            descriptor: Arc::clone(self),
            address,
        })
    }

    /// Repoints the descriptor. Calls already pinned keep the old address.
    pub(crate) fn store(&self, address: NonZeroUsize) {
        self.address.store(address.get(), Ordering::Release);
    }

    /// Zeroes the descriptor once every pinned call has returned.
    ///
    /// Must not be called with the registry lock held.
    pub(crate) fn invalidate(&self) {
        let mut pins = self.lock_pins();
        pins.retiring = true;
        let mut pins = self
            .released
            .wait_while(pins, |pins| pins.active > 0)
            .unwrap_or_else(PoisonError::into_inner);
        self.address.store(0, Ordering::Release);
        pins.retiring = false;
    }

    // A counter cannot be left half-updated, so a poisoned lock is recovered.
    fn lock_pins(&self) -> MutexGuard<'_, Pins> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A valid address kept alive for as long as this value is held.
#[derive(Debug)]
#[must_use = "dropping the pin immediately releases the address"]
pub struct PinnedAddress {
    descriptor: Arc<FunctionDescriptor>,
    address: NonZeroUsize,
}

impl PinnedAddress {
    pub fn get(&self) -> NonZeroUsize {
        self.address
    }
}

impl Drop for PinnedAddress {
    fn drop(&mut self) {
        let mut pins = self.descriptor.lock_pins();
        pins.active -= 1;
        if pins.active == 0 {
            self.descriptor.released.notify_all();
        }
    }
}
