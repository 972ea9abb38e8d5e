//! Virtual timers
//!
//! Virtual time is a pair of an *epoch* number and a *sub-epoch* offset
//! measured in hardware ticks from the start of the epoch. An epoch lasts
//! [`KernelCfg1::EPOCH_TICKS`] ticks.
//!
//! Pending requests live in two min-heaps keyed by their deadlines:
//!
//!  - The short-term heap holds the requests due in the current epoch. It
//!    also holds exactly one *tick entry* due at the end of the current
//!    epoch. Dispatching the tick entry starts the next epoch and re-pushes
//!    the tick entry.
//!
//!  - The long-term heap holds the requests due in later epochs. They are
//!    moved to the short-term heap when their epoch begins.
//!
//! The head of the short-term heap is backed by one hardware timer channel.
//! When the head is closer than [`PortTimer::SPIN_BARRIER`] ticks away, or no
//! channel is free, the kernel busy-waits for it instead.
//!
//! The pool entries track their heap positions through a separate token
//! ([`VtimerPropToken`]) owned by the heap cell. This way the heap callbacks
//! can update the entries while the heap itself is borrowed.
//!
//! [`KernelCfg1::EPOCH_TICKS`]: crate::KernelCfg1::EPOCH_TICKS
//! [`PortTimer::SPIN_BARRIER`]: crate::PortTimer::SPIN_BARRIER
use core::fmt;

use crate::{
    error::{
        BadContextError, CancelVtimerError, NoChannelError, NotFoundError, QueueOverflowError,
        RequestVtimerError, TimeError, VtimerSleepError,
    },
    hwtimer::{self, HwTimerHandle, TimerHandler, TimerTarget},
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    sched,
    task::{self, Pid, TaskSt},
    utils::{
        binary_heap::{BinaryHeap, BinaryHeapCtx, VecLike},
        Init,
    },
    KernelTraits, UTicks,
};

/// A point in virtual time.
///
/// The derived ordering compares `epoch` first. A 64-bit epoch counter
/// doesn't wrap within the lifetime of a system, so the ordering holds
/// forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpochTime {
    pub epoch: u64,
    /// The offset from the start of `epoch`, in ticks. Normalized values are
    /// less than the epoch length.
    pub sub: UTicks,
}

impl EpochTime {
    /// Advance by `ticks`, carrying whole epochs of `epoch_ticks` ticks into
    /// `epoch`. The result is normalized even if `self` isn't.
    pub const fn add_ticks(self, ticks: UTicks, epoch_ticks: UTicks) -> Self {
        let total = self.sub as u64 + ticks as u64;
        let epoch_ticks = epoch_ticks as u64;
        Self {
            epoch: self.epoch + total / epoch_ticks,
            sub: (total % epoch_ticks) as UTicks,
        }
    }
}

/// The heap key. Requests with equal deadlines are dispatched in the order
/// they were made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    at: EpochTime,
    seq: u64,
}

/// An element of the virtual timer heaps.
#[derive(Debug, Clone, Copy)]
pub struct VtimerQueueEntry {
    key: Key,
    /// An index into [`KernelCfg2::vtimer_cb_pool`] or [`TICK_SLOT`].
    ///
    /// [`KernelCfg2::vtimer_cb_pool`]: crate::KernelCfg2::vtimer_cb_pool
    slot: usize,
}

/// The `slot` of the tick entry.
const TICK_SLOT: usize = usize::MAX;

/// Identifies a pending virtual timer request.
///
/// A handle goes stale once its request fires or is cancelled, even if the
/// pool entry is reused by a later request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VtimerHandle {
    slot: usize,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VtimerSt {
    Free,
    ShortTerm,
    LongTerm,
}

impl Init for VtimerSt {
    const INIT: Self = Self::Free;
}

#[derive(Debug, Clone, Copy)]
enum VtimerAction {
    Callback(fn(usize), usize),
    Wakeup(Pid),
}

struct VtimerPropTag<Traits>(Traits);

/// The key that "unlocks" [`VtimerPropCell`].
type VtimerPropToken<Traits> = tokenlock::UnsyncSingletonToken<VtimerPropTag<Traits>>;
type VtimerPropTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, VtimerPropTag<Traits>>;

/// The keyhole type for [`VtimerPropCell`].
type VtimerPropKeyhole<Traits> = tokenlock::SingletonTokenId<VtimerPropTag<Traits>>;

/// Cell type that can be accessed by [`VtimerPropToken`].
type VtimerPropCell<Traits, T> = tokenlock::UnsyncTokenLock<T, VtimerPropKeyhole<Traits>>;

/// A slot in the virtual timer pool.
pub struct VtimerCb<Traits> {
    st: VtimerPropCell<Traits, VtimerSt>,
    /// Incremented every time the slot is freed.
    generation: VtimerPropCell<Traits, u32>,
    action: VtimerPropCell<Traits, Option<VtimerAction>>,
    /// The position in the heap selected by `st`. Unspecified if `st` is
    /// `Free`.
    heap_pos: VtimerPropCell<Traits, usize>,
}

impl<Traits> Init for VtimerCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        st: Init::INIT,
        generation: Init::INIT,
        action: Init::INIT,
        heap_pos: Init::INIT,
    };
}

impl<Traits> fmt::Debug for VtimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VtimerCb").finish_non_exhaustive()
    }
}

struct VtimerQueues<Traits, Heap> {
    short_term: Heap,
    long_term: Heap,
    prop_token: VtimerPropToken<Traits>,
}

/// A kernel-global state for virtual timers.
pub(crate) struct VtimerGlobals<Traits, Heap> {
    queues: CpuLockCell<Traits, VtimerQueues<Traits, Heap>>,
    epoch: CpuLockCell<Traits, u64>,
    /// The hardware counter value at which `epoch` started.
    epoch_start: CpuLockCell<Traits, UTicks>,
    next_seq: CpuLockCell<Traits, u64>,
    /// The channel backing the short-term head and the deadline it was armed
    /// for.
    armed: CpuLockCell<Traits, Option<(HwTimerHandle, EpochTime)>>,
    /// Set while a request is being dispatched. Suppresses nested
    /// reconciliation from callbacks.
    dispatching: CpuLockCell<Traits, bool>,
}

impl<Traits, Heap: Init> Init for VtimerGlobals<Traits, Heap> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        queues: CpuLockCell::new(VtimerQueues {
            short_term: Init::INIT,
            long_term: Init::INIT,
            // Safety: Only one instance of `VtimerGlobals<Traits, _>` exists
            //         per kernel instance
            prop_token: unsafe { VtimerPropToken::new_unchecked() },
        }),
        epoch: Init::INIT,
        epoch_start: Init::INIT,
        next_seq: Init::INIT,
        armed: Init::INIT,
        dispatching: Init::INIT,
    };
}

impl<Traits: KernelTraits, Heap: VecLike<Element = VtimerQueueEntry>> fmt::Debug
    for VtimerGlobals<Traits, Heap>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VtimerGlobals")
            .field(
                "queues",
                &self.queues.debug_with(|queues, f| {
                    f.debug_struct("VtimerQueues")
                        .field("short_term", &&queues.short_term[..])
                        .field("long_term", &&queues.long_term[..])
                        .finish()
                }),
            )
            .field("epoch", &self.epoch)
            .field("epoch_start", &self.epoch_start)
            .field("next_seq", &self.next_seq)
            .field("armed", &self.armed)
            .field("dispatching", &self.dispatching)
            .finish()
    }
}

/// Used when manipulating the heaps. Keeps [`VtimerCb::heap_pos`] up-to-date.
struct VtimerHeapCtx<'a, Traits> {
    prop_token: VtimerPropTokenRefMut<'a, Traits>,
}

impl<Traits: KernelTraits> BinaryHeapCtx<VtimerQueueEntry> for VtimerHeapCtx<'_, Traits> {
    #[inline]
    fn lt(&mut self, x: &VtimerQueueEntry, y: &VtimerQueueEntry) -> bool {
        x.key < y.key
    }

    #[inline]
    fn on_move(&mut self, e: &mut VtimerQueueEntry, new_index: usize) {
        if e.slot != TICK_SLOT {
            Traits::vtimer_cb_pool()[e.slot]
                .heap_pos
                .replace(&mut *self.prop_token, new_index);
        }
    }
}

// Initialization
// ---------------------------------------------------------------------------

/// Start epoch 0 at the current counter value and schedule its tick.
///
/// The hardware timer multiplexer must be initialized first.
pub(crate) fn init<Traits: KernelTraits>(mut lock: CpuLockGuard<Traits>) -> CpuLockGuard<Traits> {
    assert!(
        Traits::EPOCH_TICKS > 0 && Traits::EPOCH_TICKS <= Traits::MAX_TICK_COUNT / 2,
        "the epoch length must be in range `1..=MAX_TICK_COUNT / 2`"
    );

    let g = &Traits::state().vtimer;
    g.epoch.replace(&mut *lock, 0);
    g.epoch_start.replace(&mut *lock, hwtimer::now::<Traits>());
    push_tick_entry(lock.borrow_mut(), 0);

    log::debug!("virtual time started; epoch length = {}", Traits::EPOCH_TICKS);

    reconcile(lock)
}

fn next_seq<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) -> u64 {
    Traits::state()
        .vtimer
        .next_seq
        .replace_with(&mut *lock, |seq| *seq + 1)
}

fn push_tick_entry<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>, epoch: u64) {
    let seq = next_seq(lock.borrow_mut());
    let entry = VtimerQueueEntry {
        key: Key {
            at: EpochTime {
                epoch,
                sub: Traits::EPOCH_TICKS,
            },
            seq,
        },
        slot: TICK_SLOT,
    };

    let VtimerQueues {
        short_term,
        prop_token,
        ..
    } = Traits::state().vtimer.queues.write(&mut *lock);
    short_term.heap_push(
        entry,
        VtimerHeapCtx {
            prop_token: prop_token.borrow_mut(),
        },
    );
}

// Queries
// ---------------------------------------------------------------------------

fn now_locked<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) -> EpochTime {
    let g = &Traits::state().vtimer;
    let elapsed =
        hwtimer::elapsed_ticks::<Traits>(g.epoch_start.get(&*lock), hwtimer::now::<Traits>());

    // `elapsed` exceeds the epoch length if the tick entry is overdue
    EpochTime {
        epoch: g.epoch.get(&*lock),
        sub: 0,
    }
    .add_ticks(elapsed, Traits::EPOCH_TICKS)
}

/// Implements [`System::vtimer_now`].
///
/// [`System::vtimer_now`]: crate::System::vtimer_now
pub(crate) fn now<Traits: KernelTraits>() -> Result<EpochTime, TimeError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Ok(now_locked(lock.borrow_mut()))
}

// Requests
// ---------------------------------------------------------------------------

fn find_free_slot<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<usize, QueueOverflowError> {
    let VtimerQueues { prop_token, .. } = Traits::state().vtimer.queues.read(&*lock);
    Traits::vtimer_cb_pool()
        .iter()
        .position(|cb| *cb.st.read(prop_token) == VtimerSt::Free)
        .ok_or(QueueOverflowError::QueueOverflow)
}

/// Queue a request in the free slot `slot`, due `offset` ticks from now.
fn insert<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
    slot: usize,
    offset: UTicks,
    action: VtimerAction,
) -> (VtimerHandle, CpuLockGuard<Traits>) {
    let g = &Traits::state().vtimer;
    let at = now_locked(lock.borrow_mut()).add_ticks(offset, Traits::EPOCH_TICKS);
    let seq = next_seq(lock.borrow_mut());
    let is_short_term = at.epoch == g.epoch.get(&*lock);
    let cb = &Traits::vtimer_cb_pool()[slot];

    let (handle, is_new_head) = {
        let VtimerQueues {
            short_term,
            long_term,
            prop_token,
        } = g.queues.write(&mut *lock);

        debug_assert_eq!(*cb.st.read(&*prop_token), VtimerSt::Free);
        let generation = *cb.generation.read(&*prop_token);
        cb.action.replace(&mut *prop_token, Some(action));

        let (heap, st) = if is_short_term {
            (short_term, VtimerSt::ShortTerm)
        } else {
            (long_term, VtimerSt::LongTerm)
        };
        cb.st.replace(&mut *prop_token, st);

        let pos = heap.heap_push(
            VtimerQueueEntry {
                key: Key { at, seq },
                slot,
            },
            VtimerHeapCtx {
                prop_token: prop_token.borrow_mut(),
            },
        );

        (VtimerHandle { slot, generation }, is_short_term && pos == 0)
    };

    log::trace!("vtimer {slot} due at {at:?} ({action:?})");

    let lock = if is_new_head && !g.dispatching.get(&*lock) {
        reconcile(lock)
    } else {
        lock
    };

    (handle, lock)
}

/// Implements [`System::vtimer_request`].
///
/// [`System::vtimer_request`]: crate::System::vtimer_request
pub(crate) fn request<Traits: KernelTraits>(
    offset: UTicks,
    callback: fn(usize),
    param: usize,
) -> Result<VtimerHandle, RequestVtimerError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let slot = find_free_slot(lock.borrow_mut())?;
    let (handle, lock) = insert(lock, slot, offset, VtimerAction::Callback(callback, param));

    // The request may have been dispatched inline
    sched::unlock_cpu_and_check_switch(lock);

    Ok(handle)
}

/// Implements [`System::vtimer_set_wakeup`].
///
/// [`System::vtimer_set_wakeup`]: crate::System::vtimer_set_wakeup
pub(crate) fn set_wakeup<Traits: KernelTraits>(
    offset: UTicks,
    pid: Pid,
) -> Result<VtimerHandle, RequestVtimerError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    task::live_task::<Traits>(lock.borrow_mut(), pid)?;
    let slot = find_free_slot(lock.borrow_mut())?;
    let (handle, lock) = insert(lock, slot, offset, VtimerAction::Wakeup(pid));
    sched::unlock_cpu_and_check_switch(lock);
    Ok(handle)
}

/// Implements [`System::vtimer_sleep`].
///
/// [`System::vtimer_sleep`]: crate::System::vtimer_sleep
pub(crate) fn sleep<Traits: KernelTraits>(ticks: UTicks) -> Result<(), VtimerSleepError> {
    task::expect_waitable_context::<Traits>()?;

    if ticks < Traits::SPIN_BARRIER {
        hwtimer::spin::<Traits>(ticks);
        return Ok(());
    }

    let mut lock = klock::lock_cpu::<Traits>()?;
    let pid = Traits::state()
        .running_task
        .get(&*lock)
        .ok_or(BadContextError::BadContext)?;
    let slot = find_free_slot(lock.borrow_mut())?;

    // Go to sleep before queueing the wake-up, which may be dispatched
    // inline if no channel is free
    sched::set_status(lock.borrow_mut(), pid, TaskSt::Sleeping);
    let (_, lock) = insert(lock, slot, ticks, VtimerAction::Wakeup(pid));
    drop(lock);

    // Safety: CPU Lock inactive
    unsafe { Traits::yield_cpu() };

    Ok(())
}

/// Implements [`System::vtimer_cancel`].
///
/// [`System::vtimer_cancel`]: crate::System::vtimer_cancel
pub(crate) fn cancel<Traits: KernelTraits>(handle: VtimerHandle) -> Result<(), CancelVtimerError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let g = &Traits::state().vtimer;

    let was_head = {
        let VtimerQueues {
            short_term,
            long_term,
            prop_token,
        } = g.queues.write(&mut *lock);

        let cb = Traits::vtimer_cb_pool()
            .get(handle.slot)
            .ok_or(NotFoundError::NotFound)?;
        if *cb.generation.read(&*prop_token) != handle.generation {
            return Err(NotFoundError::NotFound.into());
        }

        let st = *cb.st.read(&*prop_token);
        let heap = match st {
            VtimerSt::Free => return Err(NotFoundError::NotFound.into()),
            VtimerSt::ShortTerm => short_term,
            VtimerSt::LongTerm => long_term,
        };

        let pos = *cb.heap_pos.read(&*prop_token);
        let removed = heap.heap_remove(
            pos,
            VtimerHeapCtx {
                prop_token: prop_token.borrow_mut(),
            },
        );
        assert_eq!(removed.map(|e| e.slot), Some(handle.slot));

        free_slot(&mut *prop_token, cb);

        st == VtimerSt::ShortTerm && pos == 0
    };

    log::trace!("vtimer {} cancelled", handle.slot);

    let lock = if was_head && !g.dispatching.get(&*lock) {
        reconcile(lock)
    } else {
        lock
    };
    sched::unlock_cpu_and_check_switch(lock);

    Ok(())
}

/// Return the slot to the pool, invalidating outstanding handles. Returns
/// the stored action.
fn free_slot<Traits>(
    prop_token: &mut VtimerPropToken<Traits>,
    cb: &VtimerCb<Traits>,
) -> Option<VtimerAction> {
    cb.st.replace(&mut *prop_token, VtimerSt::Free);
    cb.generation
        .replace_with(&mut *prop_token, |x| x.wrapping_add(1));
    cb.action.replace(&mut *prop_token, None)
}

// Dispatching
// ---------------------------------------------------------------------------

/// Make sure the short-term head is either dispatched or backed by a
/// hardware timer channel.
///
/// Due requests are dispatched inline. This may release CPU Lock while a
/// callback runs, hence the guard passing.
pub(crate) fn reconcile<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    let g = &Traits::state().vtimer;
    if g.dispatching.get(&*lock) {
        return lock;
    }

    loop {
        let Some(head) = g.queues.read(&*lock).short_term.heap_peek().copied() else {
            // Virtual time hasn't started yet
            return lock;
        };

        let now = now_locked(lock.borrow_mut());
        if head.key.at <= now {
            lock = dispatch_head(lock);
            continue;
        }

        if let Some((channel, armed_at)) = g.armed.get(&*lock) {
            if armed_at == head.key.at {
                return lock;
            }
            hwtimer::remove_locked(lock.borrow_mut(), channel);
            g.armed.replace(&mut *lock, None);
        }

        // The head is in the current epoch and `now` precedes it, so `now`
        // is in the current epoch too
        debug_assert_eq!(head.key.at.epoch, now.epoch);
        let remaining = head.key.at.sub - now.sub;

        if remaining < Traits::SPIN_BARRIER {
            hwtimer::spin::<Traits>(remaining);
            continue;
        }

        let target = TimerTarget::Absolute(hwtimer::add_ticks::<Traits>(
            g.epoch_start.get(&*lock),
            head.key.at.sub,
        ));
        match hwtimer::set_locked(
            lock.borrow_mut(),
            target,
            TimerHandler::Kernel(on_channel_fired::<Traits>),
            0,
        ) {
            Ok(channel) => {
                g.armed.replace(&mut *lock, Some((channel, head.key.at)));
                return lock;
            }
            Err(NoChannelError::NoChannel) => {
                log::debug!("no free channel; busy-waiting {remaining} ticks for {:?}", head.key.at);
                hwtimer::spin::<Traits>(remaining);
            }
        }
    }
}

/// The [`TimerHandler::Kernel`] for the channel backing the short-term head.
fn on_channel_fired<Traits: KernelTraits>(
    _: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // The channel is already back on the free-list
    Traits::state().vtimer.armed.replace(&mut *lock, None);
    reconcile(lock)
}

/// Pop the short-term head and dispatch it.
fn dispatch_head<Traits: KernelTraits>(mut lock: CpuLockGuard<Traits>) -> CpuLockGuard<Traits> {
    let g = &Traits::state().vtimer;

    let entry = {
        let VtimerQueues {
            short_term,
            prop_token,
            ..
        } = g.queues.write(&mut *lock);
        short_term.heap_pop(VtimerHeapCtx {
            prop_token: prop_token.borrow_mut(),
        })
    };
    let Some(entry) = entry else {
        return lock;
    };

    g.dispatching.replace(&mut *lock, true);

    if entry.slot == TICK_SLOT {
        tick(lock.borrow_mut());
    } else {
        let action = {
            let VtimerQueues { prop_token, .. } = g.queues.write(&mut *lock);
            free_slot(prop_token, &Traits::vtimer_cb_pool()[entry.slot])
        };

        log::trace!("vtimer {} fired at {:?}", entry.slot, entry.key.at);

        match action {
            Some(VtimerAction::Callback(callback, param)) => {
                drop(lock);
                callback(param);
                lock = klock::relock_cpu::<Traits>();
            }
            Some(VtimerAction::Wakeup(pid)) => {
                if let Err(e) = task::wakeup_locked(lock.borrow_mut(), pid) {
                    log::debug!("timed wake-up of task {pid} ignored: {e:?}");
                }
            }
            None => unreachable!("vtimer {} has no action", entry.slot),
        }
    }

    g.dispatching.replace(&mut *lock, false);
    lock
}

/// Start the next epoch.
fn tick<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let g = &Traits::state().vtimer;

    let epoch = g.epoch.replace_with(&mut *lock, |epoch| *epoch + 1) + 1;
    g.epoch_start.replace_with(&mut *lock, |start| {
        hwtimer::add_ticks::<Traits>(*start, Traits::EPOCH_TICKS)
    });
    push_tick_entry(lock.borrow_mut(), epoch);

    // Promote the requests due in the new epoch
    let VtimerQueues {
        short_term,
        long_term,
        prop_token,
    } = g.queues.write(&mut *lock);
    let mut num_promoted = 0usize;
    while let Some(entry) = long_term.heap_peek().copied() {
        if entry.key.at.epoch > epoch {
            break;
        }
        long_term.heap_pop(VtimerHeapCtx {
            prop_token: prop_token.borrow_mut(),
        });
        Traits::vtimer_cb_pool()[entry.slot]
            .st
            .replace(&mut *prop_token, VtimerSt::ShortTerm);
        short_term.heap_push(
            entry,
            VtimerHeapCtx {
                prop_token: prop_token.borrow_mut(),
            },
        );
        num_promoted += 1;
    }

    log::trace!("epoch {epoch} began; {num_promoted} request(s) promoted");
}
