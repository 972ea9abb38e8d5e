#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
use core::{
    convert::Infallible,
    fmt,
    marker::PhantomData,
    mem::forget,
    sync::atomic::{AtomicBool, Ordering},
};

mod error;
mod hwtimer;
mod klock;
mod sched;
mod task;
pub mod utils;
mod vtimer;

#[doc(hidden)]
pub use arrayvec;

pub use self::{
    error::*,
    hwtimer::{HwTimerChannel, HwTimerHandle, TimerTarget},
    task::{readyqueue, CreateFlags, Pid, TaskAttr, TaskCb, TaskSt},
    vtimer::{EpochTime, VtimerCb, VtimerHandle, VtimerQueueEntry},
};

use self::utils::{binary_heap::VecLike, Init};

/// Unsigned integer type representing a hardware tick count.
pub type UTicks = u32;

/// Represents "system" types having sufficient trait `impl`s to instantiate the
/// kernel.
pub trait KernelTraits: PortThreading + PortTimer + KernelCfg1 + KernelCfg2 + 'static {}
impl<T: PortThreading + PortTimer + KernelCfg1 + KernelCfg2 + 'static> KernelTraits for T {}

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and context switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Yield the processor. The port calls [`PortToKernel::choose_running_task`]
    /// and switches to the task it selects.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn yield_cpu();

    /// Destroy the state of the exiting task `pid` and transfer the control
    /// to the next task, which the port selects by calling
    /// [`PortToKernel::choose_running_task`].
    ///
    /// Precondition: CPU Lock active
    unsafe fn exit_and_dispatch(pid: Pid) -> !;

    /// Disable all kernel-managed interrupts (this state is called *CPU Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Activate CPU Lock. Return `true` iff CPU Lock was inactive before the
    /// call.
    unsafe fn try_enter_cpu_lock() -> bool {
        if Self::is_cpu_lock_active() {
            false
        } else {
            // Safety: CPU Lock inactive
            unsafe { Self::enter_cpu_lock() };
            true
        }
    }

    /// Prepare the task for activation. More specifically, set the current
    /// program counter to [`TaskAttr::entry_point`] and the current stack
    /// pointer to either end of [`TaskAttr::stack`], ensuring the task will
    /// start execution from `entry_point` next time the task receives the
    /// control.
    ///
    /// Precondition: CPU Lock active
    unsafe fn initialize_task_state(pid: Pid, attr: &TaskAttr);

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a task
    /// context.
    fn is_task_context() -> bool;

    /// Return a flag indicating whether the current context is an interrupt
    /// context.
    fn is_interrupt_context() -> bool;
}

/// Implemented by a port. This trait contains items related to controlling
/// the hardware timer and its compare channels.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortTimer {
    /// The number of compare channels.
    const NUM_CHANNELS: usize;

    /// The maximum value of [`tick_count`]. The counter wraps around to zero
    /// after this value.
    ///
    /// [`tick_count`]: Self::tick_count
    const MAX_TICK_COUNT: UTicks;

    /// The virtual timer subsystem busy-waits for deadlines closer than this
    /// many ticks instead of arming a channel.
    const SPIN_BARRIER: UTicks;

    /// Read the current hardware counter value.
    unsafe fn tick_count() -> UTicks;

    /// Arm the channel `channel`. When it fires, the port must call
    /// [`PortToKernel::timer_channel_fired`] in an interrupt context. A
    /// target in the past fires as soon as possible.
    ///
    /// Precondition: CPU Lock active, the channel is disarmed
    unsafe fn arm_channel(channel: usize, target: TimerTarget);

    /// Disarm the channel `channel`. The channel must not fire after this.
    ///
    /// Precondition: CPU Lock active
    unsafe fn disarm_channel(channel: usize);
}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
#[allow(clippy::missing_safety_doc)]
pub trait PortToKernel {
    /// Initialize runtime structures and start the virtual time.
    ///
    /// Should be called for exactly once by the port.
    ///
    /// Precondition: CPU Lock active, Boot phase
    unsafe fn boot();

    /// Determine the next task to run and store it in the kernel state.
    ///
    /// Precondition: CPU Lock active / Postcondition: CPU Lock active
    unsafe fn choose_running_task();

    /// Called by the port when the compare channel `channel` fires.
    ///
    /// Precondition: CPU Lock inactive, an interrupt context
    unsafe fn timer_channel_fired(channel: usize);

    /// Return a flag indicating whether a context switch is pending. An
    /// interrupt handler epilogue should check this and call
    /// [`choose_running_task`](Self::choose_running_task) if it's set.
    fn is_context_switch_requested() -> bool;
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        hwtimer::init::<Traits>(lock.borrow_mut());
        let lock = vtimer::init::<Traits>(lock);

        log::debug!("kernel booted");

        // Post-condition: CPU Lock active
        forget(lock);
    }

    unsafe fn choose_running_task() {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        sched::choose_next_running_task::<Traits>(lock.borrow_mut());

        // Post-condition: CPU Lock active
        forget(lock);
    }

    unsafe fn timer_channel_fired(channel: usize) {
        hwtimer::dispatch::<Traits>(channel);
    }

    #[inline]
    fn is_context_switch_requested() -> bool {
        Traits::state()
            .context_switch_request
            .load(Ordering::Relaxed)
    }
}

/// Associates "system" types with kernel-private data. Use [`build!`] to
/// implement.
///
/// # Safety
///
/// This is only intended to be implemented by `build!`.
pub unsafe trait KernelCfg1: Sized + Send + Sync + 'static {
    /// The number of task priority levels. Priority `0` is the most urgent.
    const NUM_PRIORITY_LEVELS: usize;

    /// The length of an epoch in hardware ticks.
    const EPOCH_TICKS: UTicks;

    #[doc(hidden)]
    type TaskReadyQueue: readyqueue::Queue<Self>;
}

/// Associates "system" types with kernel-private data. Use [`build!`] to
/// implement.
///
/// # Safety
///
/// This is only intended to be implemented by `build!`.
pub unsafe trait KernelCfg2: PortThreading + PortTimer + KernelCfg1 {
    #[doc(hidden)]
    type VtimerHeap: VecLike<Element = VtimerQueueEntry> + Init + fmt::Debug + Send + Sync + 'static;

    /// Access the kernel's global state.
    fn state() -> &'static State<Self>;

    // FIXME: Waiting for <https://github.com/rust-lang/const-eval/issues/11>
    //        to be resolved because `TaskCb` includes interior mutability
    //        and can't be referred to by `const`
    #[doc(hidden)]
    fn task_cb_pool() -> &'static [TaskCb<Self>];

    #[doc(hidden)]
    fn hw_timer_channel_pool() -> &'static [HwTimerChannel<Self>];

    #[doc(hidden)]
    fn vtimer_cb_pool() -> &'static [VtimerCb<Self>];
}

/// Global kernel state.
pub struct State<
    Traits: KernelCfg2,
    TaskReadyQueue: 'static = <Traits as KernelCfg1>::TaskReadyQueue,
    VtimerHeap: 'static = <Traits as KernelCfg2>::VtimerHeap,
> {
    /// The currently running task.
    running_task: klock::CpuLockCell<Traits, Option<Pid>>,

    /// The number of live tasks.
    num_tasks: klock::CpuLockCell<Traits, usize>,

    /// Set when the scheduler wants [`PortToKernel::choose_running_task`] to
    /// be called. Cleared by `choose_running_task`.
    context_switch_request: AtomicBool,

    /// The task run-queues.
    task_ready_queue: TaskReadyQueue,

    hw_timer: hwtimer::HwTimerGlobals<Traits>,

    vtimer: vtimer::VtimerGlobals<Traits, VtimerHeap>,
}

impl<Traits: KernelCfg2, TaskReadyQueue: 'static + Init, VtimerHeap: 'static + Init> Init
    for State<Traits, TaskReadyQueue, VtimerHeap>
{
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        running_task: Init::INIT,
        num_tasks: Init::INIT,
        context_switch_request: Init::INIT,
        task_ready_queue: Init::INIT,
        hw_timer: Init::INIT,
        vtimer: Init::INIT,
    };
}

impl<Traits: KernelTraits, TaskReadyQueue: 'static + fmt::Debug, VtimerHeap> fmt::Debug
    for State<Traits, TaskReadyQueue, VtimerHeap>
where
    VtimerHeap: 'static + VecLike<Element = VtimerQueueEntry>,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field("running_task", &self.running_task)
            .field("num_tasks", &self.num_tasks)
            .field("context_switch_request", &self.context_switch_request)
            .field("task_ready_queue", &self.task_ready_queue)
            .field("hw_timer", &self.hw_timer)
            .field("vtimer", &self.vtimer)
            .finish()
    }
}

/// Wraps a "system" type to provide the kernel's system services.
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits> Clone for System<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits> Copy for System<Traits> {}

impl<Traits> fmt::Debug for System<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("System")
    }
}

/// Tasks and scheduling
impl<Traits: KernelTraits> System<Traits> {
    /// Create a task in a free control block and return its pid.
    ///
    /// Unless [`CreateFlags::SLEEPING`] is given, the task is linked to the
    /// run-queue for its priority. Unless [`CreateFlags::WOUT_YIELD`] is also
    /// given, this may switch to the new task before returning.
    pub fn create_task(attr: TaskAttr) -> Result<Pid, CreateTaskError> {
        task::create_task::<Traits>(attr)
    }

    /// Change the status of `pid`. This never switches tasks by itself.
    ///
    /// Only the active task may be set to [`TaskSt::Running`]. Other tasks
    /// become `Running` by being dispatched.
    pub fn set_task_status(pid: Pid, new_st: TaskSt) -> Result<(), SetTaskStatusError> {
        sched::set_task_status::<Traits>(pid, new_st)
    }

    /// Switch tasks if `current_priority <= other_priority`.
    ///
    /// In an interrupt handler (`in_isr`), the switch is deferred until the
    /// handler returns. Otherwise, the caller must be a task with CPU Lock
    /// inactive.
    pub fn sched_switch(
        current_priority: usize,
        other_priority: usize,
        in_isr: bool,
    ) -> Result<(), SchedSwitchError> {
        sched::sched_switch::<Traits>(current_priority, other_priority, in_isr)
    }

    /// Terminate the current task, putting it into the `Stopped` state and
    /// freeing its control block.
    ///
    /// # Safety
    ///
    /// The data on the task's stack are invalidated without being dropped.
    pub unsafe fn exit_task() -> Result<Infallible, ExitTaskError> {
        // Safety: Just forwarding the function call
        unsafe { task::exit_current_task::<Traits>() }
    }

    /// Get the currently running task.
    pub fn active_task() -> Result<Option<Pid>, GetActiveTaskError> {
        task::active_task::<Traits>()
    }

    /// Get the number of live tasks.
    pub fn num_tasks() -> Result<usize, QueryTaskError> {
        task::num_tasks::<Traits>()
    }

    /// Get the number of tasks linked to the run-queues.
    pub fn num_runnable_tasks() -> Result<usize, QueryTaskError> {
        sched::num_runnable_tasks::<Traits>()
    }

    /// Check that every bit of the run-queue bitmap agrees with the emptiness
    /// of the corresponding run-queue.
    pub fn run_queues_consistent() -> Result<bool, QueryTaskError> {
        sched::run_queues_consistent::<Traits>()
    }

    /// Get the status of the live task `pid`.
    pub fn task_status(pid: Pid) -> Result<TaskSt, QueryTaskError> {
        task::task_status::<Traits>(pid)
    }

    /// Get the priority the live task `pid` was created with.
    pub fn task_priority(pid: Pid) -> Result<usize, QueryTaskError> {
        task::task_priority::<Traits>(pid)
    }

    /// Measure the unused part of the task's stack, in words. Only meaningful
    /// for tasks created with [`CreateFlags::STACKTEST`].
    pub fn task_stack_free(pid: Pid) -> Result<Option<usize>, QueryTaskError> {
        task::task_stack_free::<Traits>(pid)
    }

    /// Yield the processor to the next task of the same priority.
    pub fn yield_now() -> Result<(), YieldError> {
        sched::yield_now::<Traits>()
    }

    /// Put the current task into the `Sleeping` state until
    /// [`wakeup`](Self::wakeup) is called for it.
    pub fn sleep() -> Result<(), SleepError> {
        task::sleep::<Traits>()
    }

    /// Wake up the `Sleeping` task `pid`.
    pub fn wakeup(pid: Pid) -> Result<(), WakeupError> {
        task::wakeup::<Traits>(pid)
    }
}

/// Hardware timer multiplexer
impl<Traits: KernelTraits> System<Traits> {
    /// Read the hardware counter.
    pub fn hw_timer_now() -> UTicks {
        hwtimer::now::<Traits>()
    }

    /// Call `callback(param)` from an interrupt context `offset` ticks from
    /// now. Fails with `NoChannel` if every channel is in use.
    pub fn hw_timer_set(
        offset: UTicks,
        callback: fn(usize),
        param: usize,
    ) -> Result<HwTimerHandle, SetHwTimerError> {
        hwtimer::set::<Traits>(offset, callback, param)
    }

    /// Like [`hw_timer_set`](Self::hw_timer_set), but the deadline is an
    /// absolute counter value.
    pub fn hw_timer_set_absolute(
        at: UTicks,
        callback: fn(usize),
        param: usize,
    ) -> Result<HwTimerHandle, SetHwTimerError> {
        hwtimer::set_absolute::<Traits>(at, callback, param)
    }

    /// Disarm and free a channel allocated by
    /// [`hw_timer_set`](Self::hw_timer_set).
    ///
    /// # Panics
    ///
    /// Panics if the channel has already fired or been removed.
    pub fn hw_timer_remove(handle: HwTimerHandle) -> Result<(), RemoveHwTimerError> {
        hwtimer::remove::<Traits>(handle)
    }

    /// Busy-wait for `ticks` hardware ticks.
    pub fn hw_timer_spin(ticks: UTicks) {
        hwtimer::spin::<Traits>(ticks)
    }

    /// Put the current task to sleep for `ticks` ticks using a dedicated
    /// hardware channel.
    ///
    /// Unlike [`vtimer_sleep`](Self::vtimer_sleep), this doesn't consume a
    /// virtual timer. Durations shorter than [`PortTimer::SPIN_BARRIER`] are
    /// busy-waited, and so is the whole duration when every channel is in
    /// use.
    pub fn hw_timer_wait(ticks: UTicks) -> Result<(), HwTimerWaitError> {
        hwtimer::wait::<Traits>(ticks)
    }

    /// Get the number of allocated channels. The counter must keep running
    /// while this is non-zero.
    pub fn hw_timer_sleep_block_count() -> usize {
        hwtimer::sleep_block_count::<Traits>()
    }
}

/// Virtual timers
impl<Traits: KernelTraits> System<Traits> {
    /// Get the current virtual time.
    pub fn vtimer_now() -> Result<EpochTime, TimeError> {
        vtimer::now::<Traits>()
    }

    /// Call `callback(param)` `offset` ticks from now.
    ///
    /// The callback runs with CPU Lock inactive, usually from an interrupt
    /// context. If the deadline is too close or no hardware channel is free,
    /// it's called from the context that made it due, which may be this
    /// call.
    pub fn vtimer_request(
        offset: UTicks,
        callback: fn(usize),
        param: usize,
    ) -> Result<VtimerHandle, RequestVtimerError> {
        vtimer::request::<Traits>(offset, callback, param)
    }

    /// Cancel a pending request. Fails with `NotFound` if the request has
    /// already fired or been cancelled.
    pub fn vtimer_cancel(handle: VtimerHandle) -> Result<(), CancelVtimerError> {
        vtimer::cancel::<Traits>(handle)
    }

    /// Put the current task to sleep for `ticks` ticks. Durations shorter
    /// than [`PortTimer::SPIN_BARRIER`] are busy-waited.
    pub fn vtimer_sleep(ticks: UTicks) -> Result<(), VtimerSleepError> {
        vtimer::sleep::<Traits>(ticks)
    }

    /// Wake up the task `pid` `offset` ticks from now. The wake-up is
    /// dropped if the task isn't `Sleeping` by then.
    pub fn vtimer_set_wakeup(offset: UTicks, pid: Pid) -> Result<VtimerHandle, RequestVtimerError> {
        vtimer::set_wakeup::<Traits>(offset, pid)
    }
}

/// Attach kernel-private data to a "system" type by implementing
/// [`KernelCfg1`] and [`KernelCfg2`].
///
/// ```rust,ignore
/// ember_kernel::build!(
///     SystemTraits,
///     num_tasks = 8,
///     num_priority_levels = 4,
///     num_vtimers = 16,
///     epoch_ticks = 10_000,
/// );
/// ```
///
/// `num_priority_levels` must not exceed 128. `epoch_ticks` must not exceed
/// half of [`PortTimer::MAX_TICK_COUNT`].
#[macro_export]
macro_rules! build {
    (
        $Traits:ty,
        num_tasks = $num_tasks:expr,
        num_priority_levels = $num_priority_levels:expr,
        num_vtimers = $num_vtimers:expr,
        epoch_ticks = $epoch_ticks:expr $(,)?
    ) => {
        const _: () = {
            use $crate::{
                arrayvec::ArrayVec,
                readyqueue,
                utils::Init,
                HwTimerChannel, KernelCfg1, KernelCfg2, PortTimer, State, TaskCb, UTicks,
                VtimerCb, VtimerQueueEntry,
            };

            const NUM_PRIORITY_LEVELS: usize = $num_priority_levels;
            const NUM_VTIMERS: usize = $num_vtimers;

            // Safety: We are `build!`, so it's okay to `impl` this
            unsafe impl KernelCfg1 for $Traits {
                const NUM_PRIORITY_LEVELS: usize = NUM_PRIORITY_LEVELS;
                const EPOCH_TICKS: UTicks = $epoch_ticks;
                type TaskReadyQueue = readyqueue::BitmapQueue<$Traits, NUM_PRIORITY_LEVELS>;
            }

            static TASK_CB_POOL: [TaskCb<$Traits>; $num_tasks] = Init::INIT;
            static HW_TIMER_CHANNEL_POOL: [HwTimerChannel<$Traits>;
                <$Traits as PortTimer>::NUM_CHANNELS] = Init::INIT;
            static VTIMER_CB_POOL: [VtimerCb<$Traits>; NUM_VTIMERS] = Init::INIT;

            // Instantiate the global state
            static KERNEL_STATE: State<$Traits> = Init::INIT;

            // Safety: We are `build!`, so it's okay to `impl` this
            unsafe impl KernelCfg2 for $Traits {
                // The short-term heap also holds the tick entry
                type VtimerHeap = ArrayVec<VtimerQueueEntry, { NUM_VTIMERS + 1 }>;

                #[inline(always)]
                fn state() -> &'static State<Self> {
                    &KERNEL_STATE
                }

                #[inline(always)]
                fn task_cb_pool() -> &'static [TaskCb<Self>] {
                    &TASK_CB_POOL
                }

                #[inline(always)]
                fn hw_timer_channel_pool() -> &'static [HwTimerChannel<Self>] {
                    &HW_TIMER_CHANNEL_POOL
                }

                #[inline(always)]
                fn vtimer_cb_pool() -> &'static [VtimerCb<Self>] {
                    &VTIMER_CB_POOL
                }
            }
        };
    };
}
