//! Semaphores
//!
//! [`Sm`] is the kernel's counting semaphore, used both as a signaller
//! (ring buffers, close notifications, join handshakes) and, through
//! [`UserSm`], as the blocking mutex all shared state above the
//! substrate is guarded with.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use aegis_cap::{CapRange, CapSel, Perm, Result};
use aegis_sys::invoke;

/// A counting kernel semaphore.
pub struct Sm {
    sel: CapSel,
    owned: bool,
}

impl Sm {
    /// Create a semaphore with the given initial count.
    pub fn new(initial: u64) -> Result<Self> {
        let sel = invoke::sel_alloc(1, 1);
        invoke::create_sm(sel, initial)?;
        Ok(Self { sel, owned: true })
    }

    /// Wrap a delegated semaphore selector. No ownership.
    #[must_use]
    pub fn attached(sel: CapSel) -> Self {
        Self { sel, owned: false }
    }

    #[inline]
    #[must_use]
    pub fn sel(&self) -> CapSel {
        self.sel
    }

    pub fn up(&self) -> Result<()> {
        invoke::sm_up(self.sel)
    }

    pub fn down(&self) -> Result<()> {
        invoke::sm_down(self.sel)
    }

    /// Block until the count is non-zero, then drain it.
    pub fn zero(&self) -> Result<()> {
        invoke::sm_zero(self.sel)
    }
}

impl Drop for Sm {
    fn drop(&mut self) {
        if self.owned {
            invoke::revoke(CapRange::new(self.sel, 1, Perm::all()), true);
            invoke::sel_free(self.sel, 1);
        }
    }
}

/// A blocking mutex built on a kernel semaphore with initial count 1.
///
/// Unlike a spinlock this suspends the loser in the kernel, which is
/// what broker and handler threads need: they hold these locks across
/// portal calls and memory copies.
pub struct UserSm<T = ()> {
    sm: Sm,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialised by the semaphore.
unsafe impl<T: Send> Send for UserSm<T> {}
unsafe impl<T: Send> Sync for UserSm<T> {}

impl<T> UserSm<T> {
    pub fn new(data: T) -> Result<Self> {
        Ok(Self { sm: Sm::new(1)?, data: UnsafeCell::new(data) })
    }

    /// Acquire the lock, blocking in the kernel until it is free.
    pub fn lock(&self) -> UserSmGuard<'_, T> {
        // a failing down means the semaphore was revoked underneath
        // us, which only happens while tearing the owner down; at that
        // point no second holder can exist anymore
        let _ = self.sm.down();
        UserSmGuard { sm: self }
    }
}

/// Guard of a [`UserSm`]; releases the lock on drop.
pub struct UserSmGuard<'a, T> {
    sm: &'a UserSm<T>,
}

impl<T> Deref for UserSmGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the semaphore is held
        unsafe { &*self.sm.data.get() }
    }
}

impl<T> DerefMut for UserSmGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the semaphore is held
        unsafe { &mut *self.sm.data.get() }
    }
}

impl<T> Drop for UserSmGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.sm.sm.up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sm_counts() {
        aegis_sys::invoke::boot(2);
        let sm = Sm::new(2).unwrap();
        sm.down().unwrap();
        sm.down().unwrap();
        sm.up().unwrap();
        sm.down().unwrap();
    }

    #[test]
    fn test_usersm_exclusion() {
        aegis_sys::invoke::boot(2);
        let sm = UserSm::new(0u64).unwrap();
        {
            let mut g = sm.lock();
            *g += 1;
        }
        assert_eq!(*sm.lock(), 1);
    }
}
