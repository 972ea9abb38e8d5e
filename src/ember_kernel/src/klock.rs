//! CPU Lock and the cells it protects
//!
//! Kernel state lives in [`CpuLockCell`]s. A cell is opened with the
//! singleton [`CpuLockToken`], and the only way to get hold of the token is
//! to enter CPU Lock through [`lock_cpu`] (or to prove it's already active
//! with [`assume_cpu_lock`]). Holding the token therefore means interrupts
//! are masked and no other context can touch the state.
use core::fmt;
use tokenlock::UnsyncTokenLock;

use crate::{error::BadContextError, utils::Init, PortThreading};

pub(crate) struct CpuLockTag<Traits>(Traits);

/// Proof that CPU Lock is active. Opens every [`CpuLockCell`] of the same
/// kernel instance.
pub(crate) type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;

type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// A reborrow of [`CpuLockGuard`] that is passed by value.
///
/// Unlike `&mut CpuLockGuard`, it isn't reborrowed implicitly at call sites.
/// Call [`borrow_mut`](tokenlock::UnsyncSingletonTokenRefMut::borrow_mut)
/// to keep using it after passing it on.
pub(crate) type CpuLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;

/// A piece of kernel state only reachable with CPU Lock active.
pub(crate) struct CpuLockCell<Traits, T>(UnsyncTokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::INIT, x))
    }

    #[inline]
    pub(crate) fn read<'a>(&'a self, token: &'a CpuLockToken<Traits>) -> &'a T {
        self.0.read(token)
    }

    #[inline]
    pub(crate) fn write<'a>(&'a self, token: &'a mut CpuLockToken<Traits>) -> &'a mut T {
        self.0.write(token)
    }

    #[inline]
    pub(crate) fn get(&self, token: &CpuLockToken<Traits>) -> T
    where
        T: Copy,
    {
        *self.read(token)
    }

    /// Store `x` and return the old contents.
    #[inline]
    pub(crate) fn replace(&self, token: &mut CpuLockToken<Traits>, x: T) -> T {
        core::mem::replace(self.write(token), x)
    }

    /// Store `f(&mut old)` and return `old`.
    #[inline]
    pub(crate) fn replace_with(
        &self,
        token: &mut CpuLockToken<Traits>,
        f: impl FnOnce(&mut T) -> T,
    ) -> T {
        let slot = self.write(token);
        let new = f(slot);
        core::mem::replace(slot, new)
    }
}

impl<Traits: PortThreading, T> CpuLockCell<Traits, T> {
    /// Wrap the cell for `Debug` output, formatting the contents with `fmt`.
    ///
    /// Debug output has to take CPU Lock on its own. If it's already held,
    /// a placeholder is printed instead.
    pub(crate) fn debug_with<'a>(
        &'a self,
        fmt: impl Fn(&T, &mut fmt::Formatter) -> fmt::Result + 'a,
    ) -> impl fmt::Debug + 'a {
        struct Locked<'a, Traits, T, F>(&'a CpuLockCell<Traits, T>, F);

        impl<Traits: PortThreading, T, F> fmt::Debug for Locked<'_, Traits, T, F>
        where
            F: Fn(&T, &mut fmt::Formatter) -> fmt::Result,
        {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match lock_cpu::<Traits>() {
                    Ok(lock) => (self.1)(self.0.read(&lock), f),
                    Err(_) => f.write_str("<CPU Lock held>"),
                }
            }
        }

        Locked(self, fmt)
    }
}

impl<Traits: PortThreading, T: fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.debug_with(<T as fmt::Debug>::fmt), f)
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new(T::INIT);
}

/// Enter CPU Lock. Fails with `BadContext` if it's already active, in which
/// case some other frame owns the token.
pub(crate) fn lock_cpu<Traits: PortThreading>() -> Result<CpuLockGuard<Traits>, BadContextError>
{
    // Safety: The kernel is the only caller
    if unsafe { Traits::try_enter_cpu_lock() } {
        // Safety: We've just entered CPU Lock, so nobody holds a guard
        Ok(unsafe { assume_cpu_lock() })
    } else {
        Err(BadContextError::BadContext)
    }
}

/// Take CPU Lock back after running an application callback with it
/// released. A callback that returned with CPU Lock still active is
/// tolerated.
pub(crate) fn relock_cpu<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    // Safety: The kernel is the only caller. The guard that existed before
    // the callback was dropped, so whichever way `try_enter_cpu_lock` goes,
    // CPU Lock is active and unowned afterwards.
    unsafe {
        Traits::try_enter_cpu_lock();
        assume_cpu_lock()
    }
}

/// Mint a guard for a CPU Lock state entered elsewhere, such as by the port
/// before calling into the kernel.
///
/// # Safety
///
/// CPU Lock must be active, and no other `CpuLockGuard` may exist.
pub(crate) unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        // Safety: The token is unique because the guard is, which the caller
        // guarantees
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// Owns the CPU Lock state and leaves it on drop. Derefs to the token.
///
/// Pass it on with `core::mem::forget` when CPU Lock must outlive the guard.
pub(crate) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    pub(crate) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: The guard exists, so CPU Lock is active and the kernel
        // owns it
        unsafe { Traits::leave_cpu_lock() };
    }
}

impl<Traits: PortThreading> core::ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> core::ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
