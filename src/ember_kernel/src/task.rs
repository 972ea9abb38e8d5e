//! Tasks
use core::{convert::Infallible, fmt, sync::atomic::AtomicUsize, sync::atomic::Ordering};

use crate::{
    error::{
        BadContextError, BadIdError, BadObjectStateError, BadParamError, CreateTaskError,
        ExitTaskError, GetActiveTaskError, QueryTaskError, QueueOverflowError, SleepError,
        WakeupError, WakeupLockedError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    sched,
    utils::{intrusive_list::Link, Init},
    KernelTraits, PortThreading,
};

#[doc(hidden)]
pub mod readyqueue;

/// Task identifier: the index of the task's control block in the task pool.
///
/// A pid stays unique while its task is alive and becomes reusable once the
/// task exits.
pub type Pid = usize;

bitflags::bitflags! {
    /// Options for [`System::create_task`].
    ///
    /// [`System::create_task`]: crate::System::create_task
    pub struct CreateFlags: u8 {
        /// Create the task in the `Sleeping` state instead of `Pending`.
        const SLEEPING = 1 << 0;
        /// Don't check for a context switch after the task was created.
        const WOUT_YIELD = 1 << 1;
        /// Fill the whole stack with a known pattern so that
        /// [`System::task_stack_free`] can measure its unused part.
        ///
        /// [`System::task_stack_free`]: crate::System::task_stack_free
        const STACKTEST = 1 << 2;
    }
}

/// The creation-time properties of a task.
#[derive(Debug, Clone, Copy)]
pub struct TaskAttr {
    /// The name of the task. Only used for diagnostics.
    pub name: &'static str,

    /// The priority of the task. Lower values are more urgent.
    pub priority: usize,

    /// The entry point of the task.
    pub entry_point: fn(usize),

    /// The parameter supplied for `entry_point`.
    pub entry_param: usize,

    /// The stack region for the task. The word at index 0 is the base of the
    /// stack (the end farthest from the initial stack pointer).
    pub stack: Option<&'static [AtomicUsize]>,

    pub flags: CreateFlags,
}

impl TaskAttr {
    /// Construct a `TaskAttr` with no stack region, a zero parameter, and no
    /// flags.
    pub const fn new(name: &'static str, entry_point: fn(usize), priority: usize) -> Self {
        Self {
            name,
            priority,
            entry_point,
            entry_param: 0,
            stack: None,
            flags: CreateFlags::empty(),
        }
    }

    pub const fn param(self, entry_param: usize) -> Self {
        Self {
            entry_param,
            ..self
        }
    }

    pub const fn stack(self, stack: &'static [AtomicUsize]) -> Self {
        Self {
            stack: Some(stack),
            ..self
        }
    }

    pub const fn flags(self, flags: CreateFlags) -> Self {
        Self { flags, ..self }
    }
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// The task control block is free or the task has exited.
    Stopped,
    /// The task waits for [`System::wakeup`].
    ///
    /// [`System::wakeup`]: crate::System::wakeup
    Sleeping,
    /// Reserved for a mutex layer built on the kernel. The kernel itself
    /// never enters this state, but [`System::set_task_status`] accepts it
    /// and treats it like `Sleeping`.
    ///
    /// [`System::set_task_status`]: crate::System::set_task_status
    MutexBlocked,
    /// Reserved for an IPC layer, like [`MutexBlocked`](Self::MutexBlocked).
    ReceiveBlocked,
    /// Reserved for an IPC layer, like [`MutexBlocked`](Self::MutexBlocked).
    SendBlocked,
    /// Reserved for an IPC layer, like [`MutexBlocked`](Self::MutexBlocked).
    ReplyBlocked,
    /// The task is the active task.
    Running,
    /// The task is runnable and waits for its turn.
    Pending,
}

impl TaskSt {
    /// Get a flag indicating whether a task in this state is linked to a
    /// run-queue.
    #[inline]
    pub const fn is_on_runqueue(self) -> bool {
        matches!(self, Self::Running | Self::Pending)
    }
}

impl Init for TaskSt {
    const INIT: Self = Self::Stopped;
}

/// *Task control block* - the state data of a task.
pub struct TaskCb<Traits: PortThreading> {
    /// The properties the task was created with. `None` iff this control
    /// block is free.
    pub(crate) attr: CpuLockCell<Traits, Option<TaskAttr>>,

    /// The priority of the task. Outlives `attr` during the exit sequence,
    /// which needs it to unlink the task after freeing the control block.
    pub(crate) priority: CpuLockCell<Traits, usize>,

    pub(crate) st: CpuLockCell<Traits, TaskSt>,

    /// Links the task into the run-queue for its priority while the task is
    /// `Running` or `Pending`.
    pub(crate) link: CpuLockCell<Traits, Option<Link>>,
}

impl<Traits: PortThreading> Init for TaskCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        attr: Init::INIT,
        priority: Init::INIT,
        st: Init::INIT,
        link: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("attr", &self.attr)
            .field("priority", &self.priority)
            .field("st", &self.st)
            .field("link", &self.link)
            .finish()
    }
}

/// Get the [`TaskCb`] for the specified pid. Fails if `pid` is out of range.
#[inline]
pub(crate) fn task_cb<Traits: KernelTraits>(
    pid: Pid,
) -> Result<&'static TaskCb<Traits>, BadIdError> {
    Traits::task_cb_pool().get(pid).ok_or(BadIdError::BadId)
}

/// Get the [`TaskCb`] and the attributes of the live task `pid`.
#[inline]
pub(crate) fn live_task<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    pid: Pid,
) -> Result<(&'static TaskCb<Traits>, TaskAttr), BadIdError> {
    let task_cb = task_cb::<Traits>(pid)?;
    let attr = task_cb.attr.get(&*lock).ok_or(BadIdError::BadId)?;
    Ok((task_cb, attr))
}

/// Get the priority of the active task.
pub(crate) fn active_priority<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Option<usize> {
    let pid = Traits::state().running_task.get(&*lock)?;
    Some(Traits::task_cb_pool()[pid].priority.get(&*lock))
}

/// Implements [`System::create_task`].
///
/// [`System::create_task`]: crate::System::create_task
pub(crate) fn create_task<Traits: KernelTraits>(attr: TaskAttr) -> Result<Pid, CreateTaskError> {
    if attr.priority >= Traits::NUM_PRIORITY_LEVELS {
        return Err(BadParamError::BadParam.into());
    }

    let mut lock = klock::lock_cpu::<Traits>()?;

    // Take the first free control block
    let (pid, task_cb) = Traits::task_cb_pool()
        .iter()
        .enumerate()
        .find(|(_, task_cb)| task_cb.attr.read(&*lock).is_none())
        .ok_or(QueueOverflowError::QueueOverflow)?;

    if let Some(stack) = attr.stack {
        init_stack(stack, attr.flags.contains(CreateFlags::STACKTEST));
    }

    task_cb.attr.replace(&mut *lock, Some(attr));
    task_cb.priority.replace(&mut *lock, attr.priority);

    // Safety: CPU Lock active, and the task isn't running
    unsafe { Traits::initialize_task_state(pid, &attr) };

    Traits::state()
        .num_tasks
        .replace_with(&mut *lock, |num_tasks| *num_tasks + 1);

    log::debug!(
        "created task {pid} ({:?}) at priority {}",
        attr.name,
        attr.priority
    );

    if attr.flags.contains(CreateFlags::SLEEPING) {
        sched::set_status(lock.borrow_mut(), pid, TaskSt::Sleeping);
    } else {
        sched::set_status(lock.borrow_mut(), pid, TaskSt::Pending);

        if !attr.flags.contains(CreateFlags::WOUT_YIELD) {
            sched::request_switch_for(lock.borrow_mut(), attr.priority);
        }
    }

    sched::unlock_cpu_and_check_switch(lock);

    Ok(pid)
}

/// Write the stack canary at the stack base. With `paint_all`, every word of
/// the stack is painted the same way, each holding its own address.
fn init_stack(stack: &[AtomicUsize], paint_all: bool) {
    let words = if paint_all { stack } else { stack.get(..1).unwrap_or(&[]) };
    for word in words {
        word.store(word as *const _ as usize, Ordering::Relaxed);
    }
}

/// Return a flag indicating whether the canary at the base of `stack` is
/// intact.
pub(crate) fn stack_canary_intact(stack: &[AtomicUsize]) -> bool {
    stack
        .first()
        .map_or(true, |word| word.load(Ordering::Relaxed) == word as *const _ as usize)
}

/// Implements [`System::exit_task`].
///
/// [`System::exit_task`]: crate::System::exit_task
pub(crate) unsafe fn exit_current_task<Traits: KernelTraits>() -> Result<Infallible, ExitTaskError>
{
    if !Traits::is_task_context() {
        return Err(ExitTaskError::BadContext);
    }

    // If CPU Lock is inactive, activate it.
    let mut lock = unsafe {
        if !Traits::is_cpu_lock_active() {
            Traits::enter_cpu_lock();
        }
        klock::assume_cpu_lock::<Traits>()
    };

    let state = Traits::state();
    let Some(pid) = state.running_task.get(&*lock) else {
        return Err(ExitTaskError::BadContext);
    };
    let task_cb = &Traits::task_cb_pool()[pid];

    // Free the control block so that `pid` can be reused
    task_cb.attr.replace(&mut *lock, None);
    state
        .num_tasks
        .replace_with(&mut *lock, |num_tasks| *num_tasks - 1);

    // Transition the current task to Stopped. This unlinks it from the
    // run-queue.
    assert_eq!(*task_cb.st.read(&*lock), TaskSt::Running);
    sched::set_status(lock.borrow_mut(), pid, TaskSt::Stopped);

    state.running_task.replace(&mut *lock, None);

    log::debug!("task {pid} exited");

    core::mem::forget(lock);

    // Safety: (1) The user of `exit_task` acknowledges that all preexisting
    // data on the task stack will be invalidated. (2) CPU Lock active
    unsafe {
        Traits::exit_and_dispatch(pid);
    }
}

/// Implements [`System::active_task`].
///
/// [`System::active_task`]: crate::System::active_task
pub(crate) fn active_task<Traits: KernelTraits>() -> Result<Option<Pid>, GetActiveTaskError> {
    let lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state().running_task.get(&*lock))
}

/// Implements [`System::num_tasks`].
///
/// [`System::num_tasks`]: crate::System::num_tasks
pub(crate) fn num_tasks<Traits: KernelTraits>() -> Result<usize, QueryTaskError> {
    let lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state().num_tasks.get(&*lock))
}

/// Implements [`System::task_status`].
///
/// [`System::task_status`]: crate::System::task_status
pub(crate) fn task_status<Traits: KernelTraits>(pid: Pid) -> Result<TaskSt, QueryTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let (task_cb, _) = live_task::<Traits>(lock.borrow_mut(), pid)?;
    Ok(*task_cb.st.read(&*lock))
}

/// Implements [`System::task_priority`].
///
/// [`System::task_priority`]: crate::System::task_priority
pub(crate) fn task_priority<Traits: KernelTraits>(pid: Pid) -> Result<usize, QueryTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let (_, attr) = live_task::<Traits>(lock.borrow_mut(), pid)?;
    Ok(attr.priority)
}

/// Implements [`System::task_stack_free`].
///
/// Counts the words from the stack base that still hold the painted
/// pattern. Returns `None` if the task has no stack region.
///
/// [`System::task_stack_free`]: crate::System::task_stack_free
pub(crate) fn task_stack_free<Traits: KernelTraits>(
    pid: Pid,
) -> Result<Option<usize>, QueryTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let (_, attr) = live_task::<Traits>(lock.borrow_mut(), pid)?;
    drop(lock);

    Ok(attr.stack.map(|stack| {
        stack
            .iter()
            .take_while(|word| word.load(Ordering::Relaxed) == *word as *const _ as usize)
            .count()
    }))
}

/// Implements [`System::sleep`].
///
/// [`System::sleep`]: crate::System::sleep
pub(crate) fn sleep<Traits: KernelTraits>() -> Result<(), SleepError> {
    expect_waitable_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;

    let pid = Traits::state()
        .running_task
        .get(&*lock)
        .ok_or(BadContextError::BadContext)?;
    sched::set_status(lock.borrow_mut(), pid, TaskSt::Sleeping);

    drop(lock);

    // Safety: CPU Lock inactive
    unsafe { Traits::yield_cpu() };

    Ok(())
}

/// Implements [`System::wakeup`].
///
/// [`System::wakeup`]: crate::System::wakeup
pub(crate) fn wakeup<Traits: KernelTraits>(pid: Pid) -> Result<(), WakeupError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    wakeup_locked(lock.borrow_mut(), pid)?;

    // The task is now awake, check dispatch
    sched::unlock_cpu_and_check_switch(lock);

    Ok(())
}

/// Move the `Sleeping` task `pid` to `Pending`, requesting a context switch
/// if the scheduling rule says so. The switch itself happens when CPU Lock
/// is released.
pub(crate) fn wakeup_locked<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    pid: Pid,
) -> Result<(), WakeupLockedError> {
    let (task_cb, attr) = live_task::<Traits>(lock.borrow_mut(), pid)?;

    if *task_cb.st.read(&*lock) != TaskSt::Sleeping {
        return Err(BadObjectStateError::BadObjectState.into());
    }

    sched::set_status(lock.borrow_mut(), pid, TaskSt::Pending);
    sched::request_switch_for(lock, attr.priority);

    log::trace!("woke up task {pid}");

    Ok(())
}

/// Blocking operations are only allowed in a task context with CPU Lock
/// inactive.
#[inline]
pub(crate) fn expect_waitable_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if Traits::is_task_context() && !Traits::is_cpu_lock_active() {
        Ok(())
    } else {
        Err(BadContextError::BadContext)
    }
}

impl From<BadIdError> for WakeupLockedError {
    #[inline]
    fn from(_: BadIdError) -> Self {
        Self::BadId
    }
}

impl From<BadObjectStateError> for WakeupLockedError {
    #[inline]
    fn from(_: BadObjectStateError) -> Self {
        Self::BadObjectState
    }
}
