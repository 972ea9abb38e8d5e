//! Scheduler: status transitions, task selection, and context switch requests
use core::sync::atomic::Ordering;

use crate::{
    error::{BadParamError, QueryTaskError, SchedSwitchError, SetTaskStatusError, YieldError},
    klock::{self, CpuLockGuard, CpuLockTokenRefMut},
    task::{self, readyqueue::Queue as _, Pid, TaskSt},
    KernelTraits,
};

/// Update the status of `pid`, linking it to or unlinking it from the
/// run-queue for its priority as the on-runqueue property changes.
///
/// This never chooses a new active task.
pub(crate) fn set_status<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    pid: Pid,
    new_st: TaskSt,
) {
    let task_cb = &Traits::task_cb_pool()[pid];
    let old_st = task_cb.st.replace(&mut *lock, new_st);
    let priority = task_cb.priority.get(&*lock);
    let queue = &Traits::state().task_ready_queue;

    match (old_st.is_on_runqueue(), new_st.is_on_runqueue()) {
        (false, true) => queue.push_back_task(lock.into(), pid, priority),
        (true, false) => queue.remove_task(lock.into(), pid, priority),
        _ => {}
    }

    log::trace!("task {pid}: {old_st:?} -> {new_st:?}");
}

/// Implements [`System::set_task_status`].
///
/// Only the active task may be marked `Running`. Anything else would leave
/// two tasks `Running` until the next dispatch.
///
/// [`System::set_task_status`]: crate::System::set_task_status
pub(crate) fn set_task_status<Traits: KernelTraits>(
    pid: Pid,
    new_st: TaskSt,
) -> Result<(), SetTaskStatusError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    task::live_task::<Traits>(lock.borrow_mut(), pid)?;
    if new_st == TaskSt::Running && Traits::state().running_task.get(&*lock) != Some(pid) {
        return Err(BadParamError::BadParam.into());
    }
    set_status(lock.borrow_mut(), pid, new_st);
    Ok(())
}

/// Implements `PortToKernel::choose_running_task`.
///
/// The selected task is rotated to the back of its queue, so consecutive
/// calls cycle through the tasks sharing the most urgent priority.
pub(crate) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let state = Traits::state();
    state.context_switch_request.store(false, Ordering::Relaxed);

    if let Some(prev_pid) = state.running_task.get(&*lock) {
        let prev_cb = &Traits::task_cb_pool()[prev_pid];

        // The previous task stays linked; only its status changes
        if *prev_cb.st.read(&*lock) == TaskSt::Running {
            prev_cb.st.replace(&mut *lock, TaskSt::Pending);
        }

        if let Some(attr) = prev_cb.attr.get(&*lock) {
            if let Some(stack) = attr.stack {
                if !task::stack_canary_intact(stack) {
                    log::warn!(
                        "stack overflow detected in task {prev_pid} ({:?})",
                        attr.name
                    );
                }
            }
        }
    }

    let priority = loop {
        if let Some(priority) = state
            .task_ready_queue
            .first_ready_priority(lock.borrow_mut().into())
        {
            break priority;
        }

        // Nothing is runnable. Open a window for interrupts, one of which may
        // make a task runnable.
        //
        // Safety: CPU Lock active. `lock` is not used by anyone else during
        // the window because any interrupt handler returns before the lock
        // is re-entered.
        unsafe {
            Traits::leave_cpu_lock();
            core::hint::spin_loop();
            Traits::enter_cpu_lock();
        }
    };

    let Some(pid) = state
        .task_ready_queue
        .rotate(lock.borrow_mut().into(), priority)
    else {
        panic!("run-queue {priority} is empty while its bitmap bit is set");
    };

    Traits::task_cb_pool()[pid]
        .st
        .replace(&mut *lock, TaskSt::Running);
    state.running_task.replace(&mut *lock, Some(pid));

    log::trace!("task {pid} is now running at priority {priority}");
}

/// Request a context switch if the active task's priority and `priority`
/// satisfy the switching rule of [`System::sched_switch`]. Always requests
/// one if there's no active task.
///
/// The request is deferred until CPU Lock is released in a task context
/// (see [`unlock_cpu_and_check_switch`]) or an interrupt handler returns.
///
/// [`System::sched_switch`]: crate::System::sched_switch
pub(crate) fn request_switch_for<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    priority: usize,
) {
    let should_switch = match task::active_priority::<Traits>(lock) {
        Some(current) => current <= priority,
        None => true,
    };
    if should_switch {
        Traits::state()
            .context_switch_request
            .store(true, Ordering::Relaxed);
    }
}

/// Relinquish CPU Lock. After that, if a context switch was requested and
/// the caller is a task, call `PortThreading::yield_cpu`.
///
/// System services that make a task runnable should call this before
/// returning to the caller.
pub(crate) fn unlock_cpu_and_check_switch<Traits: KernelTraits>(lock: CpuLockGuard<Traits>) {
    drop(lock);

    if Traits::is_task_context()
        && Traits::state()
            .context_switch_request
            .load(Ordering::Relaxed)
    {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Implements [`System::sched_switch`].
///
/// [`System::sched_switch`]: crate::System::sched_switch
pub(crate) fn sched_switch<Traits: KernelTraits>(
    current_priority: usize,
    other_priority: usize,
    in_isr: bool,
) -> Result<(), SchedSwitchError> {
    if current_priority > other_priority {
        return Ok(());
    }

    if in_isr {
        log::trace!("switch deferred to interrupt exit");
        Traits::state()
            .context_switch_request
            .store(true, Ordering::Relaxed);
    } else {
        task::expect_waitable_context::<Traits>()?;
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }

    Ok(())
}

/// Implements [`System::yield_now`].
///
/// [`System::yield_now`]: crate::System::yield_now
pub(crate) fn yield_now<Traits: KernelTraits>() -> Result<(), YieldError> {
    task::expect_waitable_context::<Traits>()?;
    // Safety: CPU Lock inactive
    unsafe { Traits::yield_cpu() };
    Ok(())
}

/// Implements [`System::num_runnable_tasks`].
///
/// [`System::num_runnable_tasks`]: crate::System::num_runnable_tasks
pub(crate) fn num_runnable_tasks<Traits: KernelTraits>() -> Result<usize, QueryTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state()
        .task_ready_queue
        .num_ready_tasks(lock.borrow_mut().into()))
}

/// Implements [`System::run_queues_consistent`].
///
/// [`System::run_queues_consistent`]: crate::System::run_queues_consistent
pub(crate) fn run_queues_consistent<Traits: KernelTraits>() -> Result<bool, QueryTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let queue = &Traits::state().task_ready_queue;
    Ok((0..Traits::NUM_PRIORITY_LEVELS).all(|priority| {
        let bit = queue.is_priority_ready(lock.borrow_mut().into(), priority);
        let empty = queue.is_queue_empty(lock.borrow_mut().into(), priority);
        if bit == empty {
            log::warn!("run-queue {priority} disagrees with its bitmap bit ({bit})");
        }
        bit != empty
    }))
}
