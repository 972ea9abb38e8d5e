//! Hardware timer multiplexer
//!
//! Hands out the port's compare channels from a LIFO free-list. Each
//! allocated channel stores a handler and its argument until the channel
//! fires or is removed.
use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    error::{BadContextError, HwTimerWaitError, NoChannelError, RemoveHwTimerError, SetHwTimerError},
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    sched,
    task::{self, Pid, TaskSt},
    utils::Init,
    KernelTraits, PortThreading, PortTimer, UTicks,
};

/// The compare value passed to [`PortTimer::arm_channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTarget {
    /// Fire the given number of ticks after the current counter value.
    Relative(UTicks),
    /// Fire when the counter reaches the given value.
    Absolute(UTicks),
}

/// Identifies an allocated hardware timer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwTimerHandle(usize);

impl HwTimerHandle {
    /// Get the channel index.
    #[inline]
    pub const fn channel(self) -> usize {
        self.0
    }
}

/// A function invoked when a channel fires.
pub(crate) enum TimerHandler<Traits: PortThreading> {
    /// Runs with CPU Lock held.
    Kernel(fn(usize, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>),
    /// Runs with CPU Lock released.
    App(fn(usize)),
}

impl<Traits: PortThreading> Clone for TimerHandler<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for TimerHandler<Traits> {}

impl<Traits: PortThreading> fmt::Debug for TimerHandler<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Kernel(x) => f.debug_tuple("Kernel").field(&(*x as *const ())).finish(),
            Self::App(x) => f.debug_tuple("App").field(x).finish(),
        }
    }
}

/// A slot in the channel pool.
pub struct HwTimerChannel<Traits: PortThreading> {
    /// The handler and its argument. `None` iff the channel is on the
    /// free-list.
    handler: CpuLockCell<Traits, Option<(TimerHandler<Traits>, usize)>>,
    next_free: CpuLockCell<Traits, Option<usize>>,
}

impl<Traits: PortThreading> Init for HwTimerChannel<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        handler: Init::INIT,
        next_free: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for HwTimerChannel<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HwTimerChannel")
            .field("handler", &self.handler)
            .field("next_free", &self.next_free)
            .finish()
    }
}

/// A kernel-global state for the channel pool.
pub(crate) struct HwTimerGlobals<Traits> {
    free_head: CpuLockCell<Traits, Option<usize>>,

    /// The number of allocated channels. A power-management layer must not
    /// enter a sleep mode that stops the counter while this is non-zero.
    ///
    /// Only updated with CPU Lock active.
    sleep_block: AtomicUsize,
}

impl<Traits> Init for HwTimerGlobals<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        free_head: Init::INIT,
        sleep_block: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for HwTimerGlobals<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HwTimerGlobals")
            .field("free_head", &self.free_head)
            .field("sleep_block", &self.sleep_block)
            .finish()
    }
}

/// Populate the free-list so that channel 0 is allocated first.
pub(crate) fn init<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let pool = Traits::hw_timer_channel_pool();
    assert_eq!(pool.len(), Traits::NUM_CHANNELS);

    for channel in (0..pool.len()).rev() {
        push_free::<Traits>(lock.borrow_mut(), channel);
    }
}

fn push_free<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>, channel: usize) {
    let g = &Traits::state().hw_timer;
    let slot = &Traits::hw_timer_channel_pool()[channel];
    debug_assert!(slot.handler.read(&*lock).is_none());

    let head = g.free_head.get(&*lock);
    slot.next_free.replace(&mut *lock, head);
    g.free_head.replace(&mut *lock, Some(channel));
}

fn pop_free<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) -> Option<usize> {
    let g = &Traits::state().hw_timer;
    let channel = g.free_head.get(&*lock)?;
    let next = Traits::hw_timer_channel_pool()[channel]
        .next_free
        .replace(&mut *lock, None);
    g.free_head.replace(&mut *lock, next);
    Some(channel)
}

/// Allocate a channel, store `handler`, and arm the channel.
pub(crate) fn set_locked<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    target: TimerTarget,
    handler: TimerHandler<Traits>,
    param: usize,
) -> Result<HwTimerHandle, NoChannelError> {
    let Some(channel) = pop_free::<Traits>(lock.borrow_mut()) else {
        log::trace!("no free channel for {target:?}");
        return Err(NoChannelError::NoChannel);
    };

    Traits::hw_timer_channel_pool()[channel]
        .handler
        .replace(&mut *lock, Some((handler, param)));

    // Safety: CPU Lock active, and we own `channel`
    unsafe { Traits::arm_channel(channel, target) };

    Traits::state()
        .hw_timer
        .sleep_block
        .fetch_add(1, Ordering::Relaxed);

    log::trace!("channel {channel} armed for {target:?}");

    Ok(HwTimerHandle(channel))
}

/// Disarm and free the channel.
///
/// Panics if the channel is not allocated.
pub(crate) fn remove_locked<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    handle: HwTimerHandle,
) {
    let channel = handle.0;
    let slot = &Traits::hw_timer_channel_pool()[channel];
    assert!(
        slot.handler.read(&*lock).is_some(),
        "attempted to remove the free channel {channel}"
    );

    // Safety: CPU Lock active, and we own `channel`
    unsafe { Traits::disarm_channel(channel) };

    slot.handler.replace(&mut *lock, None);
    push_free::<Traits>(lock.borrow_mut(), channel);

    Traits::state()
        .hw_timer
        .sleep_block
        .fetch_sub(1, Ordering::Relaxed);

    log::trace!("channel {channel} removed");
}

/// Implements [`System::hw_timer_set`].
///
/// [`System::hw_timer_set`]: crate::System::hw_timer_set
pub(crate) fn set<Traits: KernelTraits>(
    offset: UTicks,
    callback: fn(usize),
    param: usize,
) -> Result<HwTimerHandle, SetHwTimerError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Ok(set_locked(
        lock.borrow_mut(),
        TimerTarget::Relative(offset),
        TimerHandler::App(callback),
        param,
    )?)
}

/// Implements [`System::hw_timer_set_absolute`].
///
/// [`System::hw_timer_set_absolute`]: crate::System::hw_timer_set_absolute
pub(crate) fn set_absolute<Traits: KernelTraits>(
    at: UTicks,
    callback: fn(usize),
    param: usize,
) -> Result<HwTimerHandle, SetHwTimerError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Ok(set_locked(
        lock.borrow_mut(),
        TimerTarget::Absolute(at),
        TimerHandler::App(callback),
        param,
    )?)
}

/// Implements [`System::hw_timer_remove`].
///
/// [`System::hw_timer_remove`]: crate::System::hw_timer_remove
pub(crate) fn remove<Traits: KernelTraits>(handle: HwTimerHandle) -> Result<(), RemoveHwTimerError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    remove_locked(lock.borrow_mut(), handle);
    Ok(())
}

/// Implements `PortToKernel::timer_channel_fired`.
///
/// The channel goes back to the free-list before the handler runs, so the
/// handler can allocate it again.
pub(crate) fn dispatch<Traits: KernelTraits>(channel: usize) {
    let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
        panic!("channel {channel} fired with CPU Lock active");
    };

    let Some(slot) = Traits::hw_timer_channel_pool().get(channel) else {
        panic!("channel {channel} is out of range");
    };

    let Some((handler, param)) = slot.handler.replace(&mut *lock, None) else {
        // Removed after the hardware latched the interrupt
        log::debug!("ignoring a spurious fire of channel {channel}");
        return;
    };

    push_free::<Traits>(lock.borrow_mut(), channel);
    Traits::state()
        .hw_timer
        .sleep_block
        .fetch_sub(1, Ordering::Relaxed);

    log::trace!("channel {channel} fired");

    match handler {
        TimerHandler::Kernel(f) => drop(f(param, lock)),
        TimerHandler::App(f) => {
            drop(lock);
            f(param);
        }
    }
}

/// Implements [`System::hw_timer_sleep_block_count`].
///
/// [`System::hw_timer_sleep_block_count`]: crate::System::hw_timer_sleep_block_count
#[inline]
pub(crate) fn sleep_block_count<Traits: KernelTraits>() -> usize {
    Traits::state().hw_timer.sleep_block.load(Ordering::Relaxed)
}

/// Implements [`System::hw_timer_now`].
///
/// [`System::hw_timer_now`]: crate::System::hw_timer_now
#[inline]
pub(crate) fn now<Traits: KernelTraits>() -> UTicks {
    // Safety: Only meant to be called by the kernel
    unsafe { Traits::tick_count() }
}

/// Implements [`System::hw_timer_spin`]. Busy-waits until the counter has
/// advanced by `ticks`.
///
/// [`System::hw_timer_spin`]: crate::System::hw_timer_spin
pub(crate) fn spin<Traits: KernelTraits>(ticks: UTicks) {
    let start = now::<Traits>();
    while elapsed_ticks::<Traits>(start, now::<Traits>()) < ticks {
        core::hint::spin_loop();
    }
}

/// Implements [`System::hw_timer_wait`].
///
/// Sleeps on a channel of its own, bypassing the virtual timer queues.
/// Durations under [`PortTimer::SPIN_BARRIER`] are busy-waited, and so is the
/// whole duration if no channel is free.
///
/// [`System::hw_timer_wait`]: crate::System::hw_timer_wait
pub(crate) fn wait<Traits: KernelTraits>(ticks: UTicks) -> Result<(), HwTimerWaitError> {
    task::expect_waitable_context::<Traits>()?;

    if ticks < Traits::SPIN_BARRIER {
        spin::<Traits>(ticks);
        return Ok(());
    }

    let mut lock = klock::lock_cpu::<Traits>()?;
    let pid = Traits::state()
        .running_task
        .get(&*lock)
        .ok_or(BadContextError::BadContext)?;

    // The handler can't run before CPU Lock is released, so the channel may
    // be armed before the task goes to sleep
    let armed = set_locked(
        lock.borrow_mut(),
        TimerTarget::Relative(ticks),
        TimerHandler::Kernel(wake_waiter::<Traits>),
        pid,
    );
    if armed.is_err() {
        drop(lock);
        log::debug!("task {pid} spins for {ticks} ticks; no free channel");
        spin::<Traits>(ticks);
        return Ok(());
    }

    sched::set_status(lock.borrow_mut(), pid, TaskSt::Sleeping);
    drop(lock);

    // Safety: CPU Lock inactive
    unsafe { Traits::yield_cpu() };

    Ok(())
}

/// The handler of a channel armed by [`wait`]. A task that was woken up by
/// other means in the meantime is left alone.
fn wake_waiter<Traits: KernelTraits>(
    pid: Pid,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    if let Err(e) = task::wakeup_locked(lock.borrow_mut(), pid) {
        log::debug!("not waking up task {pid} after its wait: {e:?}");
    }
    lock
}

/// Add `delta` to the counter value `at`, wrapping at
/// [`PortTimer::MAX_TICK_COUNT`].
#[inline]
pub(crate) fn add_ticks<Traits: PortTimer>(at: UTicks, delta: UTicks) -> UTicks {
    wrapping_add(at, delta, Traits::MAX_TICK_COUNT)
}

/// Get the number of ticks from `from` to `to`, assuming the counter wrapped
/// at most once in between.
#[inline]
pub(crate) fn elapsed_ticks<Traits: PortTimer>(from: UTicks, to: UTicks) -> UTicks {
    wrapping_sub(to, from, Traits::MAX_TICK_COUNT)
}

#[inline]
fn wrapping_add(at: UTicks, delta: UTicks, max: UTicks) -> UTicks {
    if max == UTicks::MAX {
        at.wrapping_add(delta)
    } else {
        debug_assert!(at <= max && delta <= max);
        let room = max - at;
        if delta <= room {
            at + delta
        } else {
            delta - room - 1
        }
    }
}

#[inline]
fn wrapping_sub(to: UTicks, from: UTicks, max: UTicks) -> UTicks {
    if max == UTicks::MAX {
        to.wrapping_sub(from)
    } else if to >= from {
        to - from
    } else {
        to + (max - from) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn add_wraps_at_max() {
        assert_eq!(wrapping_add(0, 5, 9), 5);
        assert_eq!(wrapping_add(7, 2, 9), 9);
        assert_eq!(wrapping_add(7, 3, 9), 0);
        assert_eq!(wrapping_add(9, 9, 9), 8);
        assert_eq!(wrapping_add(u32::MAX, 1, u32::MAX), 0);
    }

    #[test]
    fn sub_wraps_at_max() {
        assert_eq!(wrapping_sub(5, 2, 9), 3);
        assert_eq!(wrapping_sub(1, 8, 9), 3);
        assert_eq!(wrapping_sub(0, 9, 9), 1);
        assert_eq!(wrapping_sub(3, u32::MAX - 1, u32::MAX), 5);
    }

    #[quickcheck]
    fn add_then_sub(at: u32, delta: u32, max: u32) -> bool {
        let max = max.max(1);
        let (at, delta) = (at % (max / 2 + 1), delta % (max / 2 + 1));
        wrapping_sub(wrapping_add(at, delta, max), at, max) == delta
    }
}
